//! The replicator: wires a pusher and a puller onto one connection, routes
//! inbound requests, owns checkpoint keys, and restarts after transient
//! failures when running continuously.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use madrona::{Error, Result};

use crate::connection::{Connection, InboundRequest};
use crate::db::DbHandle;
use crate::protocol::{self, Goodbye, Profile};
use crate::puller::{Puller, PullerMsg};
use crate::pusher::{Pusher, PusherMsg, DEFAULT_CHANGE_BATCH_SIZE};

/// Replication mode of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// This direction is off.
    #[default]
    Disabled,
    /// Serve the peer's requests, never initiate.
    Passive,
    /// Replicate the backlog, then stop.
    OneShot,
    /// Replicate the backlog, then keep following changes.
    Continuous,
}

impl Mode {
    pub fn is_active(self) -> bool {
        matches!(self, Mode::OneShot | Mode::Continuous)
    }
}

/// Replicator configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub push: Mode,
    pub pull: Mode,
    /// Checkpoint writes are coalesced over this window.
    pub checkpoint_save_delay: Duration,
    /// Rows per `changes` message and per store read.
    pub changes_batch_size: usize,
    /// Backoff floor between reconnect attempts.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            push: Mode::Disabled,
            pull: Mode::Disabled,
            checkpoint_save_delay: Duration::from_secs(5),
            changes_batch_size: DEFAULT_CHANGE_BATCH_SIZE,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

impl Options {
    pub fn pushing(mode: Mode) -> Self {
        Options {
            push: mode,
            ..Default::default()
        }
    }

    pub fn pulling(mode: Mode) -> Self {
        Options {
            pull: mode,
            ..Default::default()
        }
    }

    pub fn passive() -> Self {
        Options {
            push: Mode::Passive,
            pull: Mode::Passive,
            ..Default::default()
        }
    }
}

/// Progress notifications emitted while a replicator runs.
#[derive(Debug, Clone)]
pub enum Event {
    PushCaughtUp,
    PushCheckpoint(u64),
    PushComplete { checkpoint: u64 },
    PushFailed(Error),
    PullCaughtUp,
    PullCheckpoint(u64),
    PullComplete { checkpoint: u64 },
    PullFailed(Error),
    Stopped { error: Option<Error> },
}

#[derive(Debug, Clone, Default)]
struct SessionStatus {
    push_done: bool,
    pull_done: bool,
    error: Option<Error>,
}

/// A running replication session over one connection.
#[derive(Debug)]
pub struct Replicator {
    events_rx: flume::Receiver<Event>,
    events_tx: flume::Sender<Event>,
    status_rx: watch::Receiver<SessionStatus>,
    pusher_tx: Option<mpsc::Sender<PusherMsg>>,
    puller_tx: Option<mpsc::Sender<PullerMsg>>,
    actor_tasks: Vec<JoinHandle<()>>,
    router_task: JoinHandle<()>,
    conn: Connection,
    options: Options,
}

impl Replicator {
    /// Starts replication over an established connection. `checkpoint_name`
    /// identifies the remote for checkpoint storage; use a stable name per
    /// peer so sessions resume where they left off.
    pub async fn start(
        db: DbHandle,
        conn: Connection,
        incoming: mpsc::Receiver<InboundRequest>,
        options: Options,
        checkpoint_name: &str,
    ) -> Result<Replicator> {
        // Actors publish onto the internal channel; a monitor folds events
        // into a status watch and forwards them to the public channel, so
        // waiting for completion does not steal events from the caller.
        let (events_tx, internal_rx) = flume::unbounded();
        let (public_tx, events_rx) = flume::unbounded();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        tokio::spawn(async move {
            while let Ok(event) = internal_rx.recv_async().await {
                status_tx.send_modify(|status| match &event {
                    Event::PushComplete { .. } => status.push_done = true,
                    Event::PullComplete { .. } => status.pull_done = true,
                    Event::PushFailed(err) | Event::PullFailed(err) => {
                        if status.error.is_none() {
                            status.error = Some(err.clone());
                        }
                    }
                    _ => {}
                });
                if public_tx.send(event).is_err() {
                    break;
                }
            }
        });
        let mut actor_tasks = Vec::new();

        let pusher_tx = if options.push != Mode::Disabled {
            let key = options
                .push
                .is_active()
                .then(|| format!("checkpoint/{checkpoint_name}/push"));
            let (tx, handle) = Pusher::spawn(
                db.clone(),
                conn.clone(),
                events_tx.clone(),
                key.clone(),
                options.checkpoint_save_delay,
                options.changes_batch_size,
            );
            if let Some(key) = key {
                let since = db.get_checkpoint(key).await?;
                debug!(since, "starting push");
                let _ = tx
                    .send(PusherMsg::Start {
                        since,
                        continuous: options.push == Mode::Continuous,
                    })
                    .await;
            }
            actor_tasks.push(handle);
            Some(tx)
        } else {
            None
        };

        let puller_tx = if options.pull != Mode::Disabled {
            let key = options
                .pull
                .is_active()
                .then(|| format!("checkpoint/{checkpoint_name}/pull"));
            let (tx, handle) = Puller::spawn(
                db.clone(),
                conn.clone(),
                events_tx.clone(),
                key.clone(),
                options.checkpoint_save_delay,
                options.changes_batch_size,
            );
            if let Some(key) = key {
                let since = db.get_checkpoint(key).await?;
                debug!(since, "starting pull");
                let _ = tx
                    .send(PullerMsg::Start {
                        since,
                        continuous: options.pull == Mode::Continuous,
                    })
                    .await;
            }
            actor_tasks.push(handle);
            Some(tx)
        } else {
            None
        };

        let router_task = tokio::spawn(route_incoming(
            incoming,
            db,
            pusher_tx.clone(),
            puller_tx.clone(),
        ));

        Ok(Replicator {
            events_rx,
            events_tx,
            status_rx,
            pusher_tx,
            puller_tx,
            actor_tasks,
            router_task,
            conn,
            options,
        })
    }

    /// The stream of progress events.
    pub fn events(&self) -> flume::Receiver<Event> {
        self.events_rx.clone()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Waits until every active direction reports completion or failure,
    /// then closes the connection. Returns the first error seen.
    pub async fn wait(self) -> Result<()> {
        let want_push = self.options.push.is_active();
        let want_pull = self.options.pull.is_active();
        let mut status_rx = self.status_rx.clone();

        let failure = loop {
            let status = status_rx.borrow().clone();
            if let Some(err) = status.error {
                break Some(err);
            }
            if (!want_push || status.push_done) && (!want_pull || status.pull_done) {
                break None;
            }
            if status_rx.changed().await.is_err() {
                break None;
            }
        };

        self.shutdown(failure.clone()).await;
        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Stops both directions and closes the connection.
    pub async fn stop(self) {
        self.shutdown(None).await;
    }

    async fn shutdown(self, error: Option<Error>) {
        if let Some(tx) = &self.pusher_tx {
            let _ = tx.send(PusherMsg::Stop).await;
        }
        if let Some(tx) = &self.puller_tx {
            let _ = tx.send(PullerMsg::Stop).await;
        }
        // The actors break out of their loops on Stop (or have already
        // finished); let them run their final checkpoint save.
        for task in self.actor_tasks {
            let _ = task.await;
        }
        self.router_task.abort();
        let status = if error.is_some() { 1011 } else { 1000 };
        self.conn
            .close(Goodbye {
                status,
                reason: String::new(),
            })
            .await;
        let _ = self.events_tx.send(Event::Stopped { error });
    }
}

async fn route_incoming(
    mut incoming: mpsc::Receiver<InboundRequest>,
    db: DbHandle,
    pusher_tx: Option<mpsc::Sender<PusherMsg>>,
    puller_tx: Option<mpsc::Sender<PullerMsg>>,
) {
    while let Some(request) = incoming.recv().await {
        match request.profile {
            Profile::SubChanges => match &pusher_tx {
                Some(tx) => {
                    let _ = tx.send(PusherMsg::HandleSubChanges(request)).await;
                }
                None => {
                    request
                        .respond_err(Error::not_found("push is disabled"))
                        .await;
                }
            },
            Profile::Changes => match &puller_tx {
                Some(tx) => {
                    let _ = tx.send(PullerMsg::Changes(request)).await;
                }
                None => {
                    request
                        .respond_err(Error::not_found("pull is disabled"))
                        .await;
                }
            },
            Profile::Rev => match &puller_tx {
                Some(tx) => {
                    let _ = tx.send(PullerMsg::Rev(request)).await;
                }
                None => {
                    request
                        .respond_err(Error::not_found("pull is disabled"))
                        .await;
                }
            },
            Profile::GetAttachment => {
                let db = db.clone();
                tokio::spawn(async move {
                    let result = async {
                        let get: protocol::GetAttachment = request.decode_body()?;
                        let key = get.digest.parse()?;
                        db.read_attachment(key).await
                    }
                    .await;
                    match result {
                        Ok(contents) => {
                            request
                                .respond_ok(bytes::Bytes::new(), contents, false)
                                .await;
                        }
                        Err(err) => request.respond_err(err).await,
                    }
                });
            }
        }
    }
    debug!("inbound routing ended");
}

/// Dials replication connections; injected so the replicator owns no global
/// socket state.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> futures::future::BoxFuture<'static, Result<(Connection, mpsc::Receiver<InboundRequest>)>>;
}

/// Runs a session to completion, reconnecting with exponential backoff after
/// transient failures while either direction is continuous. Forwards every
/// session's events into `events`.
pub async fn run_with_retries<C: Connector>(
    db: DbHandle,
    connector: C,
    options: Options,
    checkpoint_name: &str,
    events: flume::Sender<Event>,
) -> Result<()> {
    let continuous =
        options.push == Mode::Continuous || options.pull == Mode::Continuous;
    let mut delay = options.retry_base_delay;

    loop {
        let outcome = match connector.connect().await {
            Ok((conn, incoming)) => {
                let replicator =
                    Replicator::start(db.clone(), conn, incoming, options.clone(), checkpoint_name)
                        .await?;
                let session_events = replicator.events();
                let forward = events.clone();
                let forwarder = tokio::spawn(async move {
                    while let Ok(event) = session_events.recv_async().await {
                        if forward.send(event).is_err() {
                            break;
                        }
                    }
                });
                let outcome = replicator.wait().await;
                forwarder.abort();
                if outcome.is_ok() {
                    delay = options.retry_base_delay;
                }
                outcome
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(err) if continuous && err.is_transient() => {
                warn!(%err, backoff = ?delay, "replication interrupted, will retry");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(options.retry_max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}
