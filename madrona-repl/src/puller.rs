//! The pull direction: subscribes to the peer's changes, tells it which
//! revisions are new here, and writes the revisions it sends through the DB
//! actor. The pull checkpoint tracks the peer's sequence numbers with the
//! same low-water rule the pusher uses.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use madrona::{Error, RevId, SequenceSet};

use crate::connection::{Connection, InboundRequest};
use crate::db::{DbHandle, IncomingRev};
use crate::protocol::{self, ChangeAnswer, ChangeRow, Profile, RevHeader, SubChanges};
use crate::replicator::Event;

const MAILBOX_CAP: usize = 128;

#[derive(derive_more::Debug, strum::Display)]
pub(crate) enum PullerMsg {
    Start {
        since: u64,
        continuous: bool,
    },
    /// An inbound `changes` announcement from the peer.
    Changes(#[debug(skip)] InboundRequest),
    /// An inbound `rev` body from the peer.
    Rev(#[debug(skip)] InboundRequest),
    Stop,
}

pub(crate) struct Puller {
    db: DbHandle,
    conn: Connection,
    events: flume::Sender<Event>,
    /// Absent on the passive side, which does not checkpoint.
    checkpoint_key: Option<String>,
    checkpoint_save_delay: Duration,
    batch_size: usize,

    continuous: bool,
    started: bool,
    last_sequence: u64,
    pending: SequenceSet,
    caught_up: bool,
    caught_up_event_sent: bool,
    checkpoint_dirty: bool,
    finished: bool,
}

impl Puller {
    pub(crate) fn spawn(
        db: DbHandle,
        conn: Connection,
        events: flume::Sender<Event>,
        checkpoint_key: Option<String>,
        checkpoint_save_delay: Duration,
        batch_size: usize,
    ) -> (mpsc::Sender<PullerMsg>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAP);
        let puller = Puller {
            db,
            conn,
            events,
            checkpoint_key,
            checkpoint_save_delay,
            batch_size,
            continuous: false,
            started: false,
            last_sequence: 0,
            pending: SequenceSet::new(),
            caught_up: false,
            caught_up_event_sent: false,
            checkpoint_dirty: false,
            finished: false,
        };
        let handle = tokio::spawn(puller.run(rx).instrument(error_span!("puller")));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PullerMsg>) {
        let mut checkpoint_timer = tokio::time::interval(self.checkpoint_save_delay);
        checkpoint_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    trace!(%msg, "tick");
                    let stop = matches!(msg, PullerMsg::Stop);
                    self.handle(msg).await;
                    if stop || self.finished {
                        break;
                    }
                }
                _ = checkpoint_timer.tick() => {
                    self.save_checkpoint_if_dirty().await;
                }
            }
        }
        self.save_checkpoint_if_dirty().await;
        trace!("puller done");
    }

    async fn handle(&mut self, msg: PullerMsg) {
        match msg {
            PullerMsg::Start { since, continuous } => {
                self.started = true;
                self.continuous = continuous;
                self.last_sequence = since;
                self.pending.clear(since);
                self.send_sub_changes(since, continuous);
            }
            PullerMsg::Changes(request) => self.handle_changes(request).await,
            PullerMsg::Rev(request) => self.handle_rev(request).await,
            PullerMsg::Stop => {
                debug!("puller stopping");
            }
        }
    }

    fn send_sub_changes(&self, since: u64, continuous: bool) {
        let conn = self.conn.clone();
        let events = self.events.clone();
        let batch = self.batch_size as u32;
        tokio::spawn(async move {
            let message = SubChanges {
                since,
                continuous,
                filter: None,
                batch: Some(batch),
            };
            if let Err(err) = conn.request(Profile::SubChanges, &message).await {
                warn!(%err, "subChanges request failed");
                let _ = events.send(Event::PullFailed(err));
            }
        });
    }

    async fn handle_changes(&mut self, request: InboundRequest) {
        if !self.started {
            // Passive side: the peer initiates.
            self.started = true;
        }
        let rows: Vec<ChangeRow> = match request.decode_body() {
            Ok(rows) => rows,
            Err(err) => {
                request.respond_err(err).await;
                return;
            }
        };

        if rows.is_empty() {
            self.caught_up = true;
            debug!("peer's change backlog fully announced");
            if request.respond_json(&Vec::<ChangeAnswer>::new()).await.is_err() {
                warn!("failed to acknowledge caught-up marker");
            }
            self.maybe_finished().await;
            return;
        }

        let mut proposals = Vec::with_capacity(rows.len());
        for row in &rows {
            match row.rev_id().parse::<RevId>() {
                Ok(rev_id) => proposals.push(Some((row.doc_id().to_string(), rev_id))),
                Err(err) => {
                    warn!(doc = row.doc_id(), rev = row.rev_id(), %err, "unusable change row");
                    proposals.push(None);
                }
            }
        }
        let lookups = self
            .db
            .find_new_revisions(proposals.iter().flatten().cloned().collect())
            .await;
        let mut lookups = match lookups {
            Ok(lookups) => lookups.into_iter(),
            Err(err) => {
                request.respond_err(err.clone()).await;
                self.fail(err);
                return;
            }
        };

        let mut answers = Vec::with_capacity(rows.len());
        for (row, proposal) in rows.iter().zip(&proposals) {
            self.pending.insert(row.sequence());
            let wanted = match proposal {
                None => None,
                Some(_) => lookups.next().unwrap_or(None),
            };
            match wanted {
                None => {
                    // Known (or unusable): complete immediately so the
                    // checkpoint keeps moving.
                    answers.push(ChangeAnswer::not_wanted());
                    self.mark_complete(row.sequence());
                }
                Some(ancestors) => {
                    answers.push(ChangeAnswer::Ancestors(
                        ancestors.iter().map(|a| a.to_string()).collect(),
                    ));
                }
            }
        }
        if request.respond_json(&answers).await.is_err() {
            warn!("failed to answer changes announcement");
        }
        self.maybe_finished().await;
    }

    async fn handle_rev(&mut self, request: InboundRequest) {
        let header: RevHeader = match request.decode_body() {
            Ok(header) => header,
            Err(err) => {
                request.respond_err(err).await;
                return;
            }
        };
        let sequence = header.sequence;
        let result = self.apply_rev(&request, &header).await;
        match result {
            Ok(()) => {
                request.respond_empty().await;
            }
            Err(err) => {
                warn!(doc = %header.id, rev = %header.rev, %err, "could not apply revision");
                request.respond_err(err).await;
            }
        }
        // Either way the peer's sequence is handled; a rejected revision is
        // not retried within this session.
        self.mark_complete(sequence);
        self.maybe_finished().await;
    }

    async fn apply_rev(&mut self, request: &InboundRequest, header: &RevHeader) -> Result<(), Error> {
        let body = protocol::decompress_if(request.payload.clone(), request.compressed)?;
        let mut history = Vec::with_capacity(1 + header.history.len());
        history.push(header.rev.parse::<RevId>()?);
        for ancestor in &header.history {
            history.push(ancestor.parse()?);
        }
        let body = (!body.is_empty()).then_some(body);
        self.db
            .insert_revision(IncomingRev {
                doc_id: header.id.clone(),
                history,
                body,
                deleted: header.deleted,
            })
            .await
    }

    fn mark_complete(&mut self, sequence: u64) {
        if !self.pending.remove(sequence) {
            warn!(sequence, "peer sequence acknowledged twice");
            return;
        }
        let completed = self.pending.completed_through();
        if completed != self.last_sequence {
            trace!(from = self.last_sequence, to = completed, "pull checkpoint advances");
            self.last_sequence = completed;
            self.checkpoint_dirty = true;
        }
    }

    async fn save_checkpoint_if_dirty(&mut self) {
        if !self.checkpoint_dirty {
            return;
        }
        self.checkpoint_dirty = false;
        let Some(key) = self.checkpoint_key.clone() else {
            return;
        };
        match self.db.set_checkpoint(key, self.last_sequence).await {
            Ok(()) => {
                let _ = self.events.send(Event::PullCheckpoint(self.last_sequence));
            }
            Err(err) => warn!(%err, "pull checkpoint save failed"),
        }
    }

    async fn maybe_finished(&mut self) {
        if self.finished || !self.started {
            return;
        }
        if !(self.caught_up && self.pending.is_empty()) {
            return;
        }
        // The passive side keeps serving until the peer goes away.
        if self.continuous || self.checkpoint_key.is_none() {
            if !self.caught_up_event_sent {
                self.caught_up_event_sent = true;
                let _ = self.events.send(Event::PullCaughtUp);
            }
        } else {
            self.save_checkpoint_if_dirty().await;
            debug!(checkpoint = self.last_sequence, "pull complete");
            let _ = self.events.send(Event::PullComplete {
                checkpoint: self.last_sequence,
            });
            self.finished = true;
        }
    }

    fn fail(&mut self, err: Error) {
        warn!(%err, "pull failed");
        let _ = self.events.send(Event::PullFailed(err));
        self.finished = true;
    }
}
