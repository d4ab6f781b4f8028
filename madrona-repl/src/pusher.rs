//! The push direction: feeds local changes to the peer and streams the
//! revision bodies it asks for, advancing a durable checkpoint as sends
//! complete in sequence order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use madrona::{Error, Result, RevId, SequenceSet};

use crate::connection::{Connection, InboundRequest, ResponseData};
use crate::db::{ChangeItem, DbHandle};
use crate::protocol::{self, ChangeAnswer, ChangeRow, Profile, RevHeader, SubChanges};
use crate::replicator::Event;

/// Cap on the ancestry sent with a `rev` message.
pub const MAX_POSSIBLE_ANCESTORS_TO_SEND: usize = 20;
/// Changes fetched from the store (and sent) per batch.
pub const DEFAULT_CHANGE_BATCH_SIZE: usize = 200;
/// How many `changes` messages may await replies at once.
pub const MAX_CHANGE_LISTS_IN_FLIGHT: u32 = 4;
/// How many `rev` messages may await replies at once.
pub const MAX_REVS_IN_FLIGHT: u32 = 5;

const MAILBOX_CAP: usize = 128;

#[derive(derive_more::Debug, strum::Display)]
pub(crate) enum PusherMsg {
    Start {
        since: u64,
        continuous: bool,
    },
    /// The peer subscribed to our changes (passive push).
    HandleSubChanges(#[debug(skip)] InboundRequest),
    GotChanges(#[debug(skip)] Result<Vec<ChangeItem>>),
    ChangesReplied {
        #[debug(skip)]
        rows: Vec<ChangeItem>,
        #[debug(skip)]
        result: Result<ResponseData>,
    },
    RevReplied {
        sequence: u64,
        #[debug(skip)]
        result: Result<()>,
    },
    ChangesNotified,
    Stop,
}

#[derive(Debug)]
struct RevToSend {
    sequence: u64,
    doc_id: String,
    rev_id: RevId,
    known_ancestors: Vec<String>,
}

pub(crate) struct Pusher {
    db: DbHandle,
    conn: Connection,
    events: flume::Sender<Event>,
    /// Absent on the passive side, which does not checkpoint.
    checkpoint_key: Option<String>,
    checkpoint_save_delay: Duration,
    tx: mpsc::Sender<PusherMsg>,

    batch_size: usize,
    continuous: bool,
    started: bool,
    subscribed: bool,

    last_sequence: u64,
    last_sequence_read: u64,
    pending: SequenceSet,
    getting_changes: bool,
    caught_up: bool,
    caught_up_sent: bool,
    caught_up_event_sent: bool,
    change_lists_in_flight: u32,
    revisions_in_flight: u32,
    revs_to_send: VecDeque<RevToSend>,
    checkpoint_dirty: bool,
    finished: bool,
}

impl Pusher {
    pub(crate) fn spawn(
        db: DbHandle,
        conn: Connection,
        events: flume::Sender<Event>,
        checkpoint_key: Option<String>,
        checkpoint_save_delay: Duration,
        batch_size: usize,
    ) -> (mpsc::Sender<PusherMsg>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAP);
        let pusher = Pusher {
            db,
            conn,
            events,
            checkpoint_key,
            checkpoint_save_delay,
            tx: tx.clone(),
            batch_size,
            continuous: false,
            started: false,
            subscribed: false,
            last_sequence: 0,
            last_sequence_read: 0,
            pending: SequenceSet::new(),
            getting_changes: false,
            caught_up: false,
            caught_up_sent: false,
            caught_up_event_sent: false,
            change_lists_in_flight: 0,
            revisions_in_flight: 0,
            revs_to_send: VecDeque::new(),
            checkpoint_dirty: false,
            finished: false,
        };
        let handle = tokio::spawn(pusher.run(rx).instrument(error_span!("pusher")));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PusherMsg>) {
        let mut checkpoint_timer = tokio::time::interval(self.checkpoint_save_delay);
        checkpoint_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    trace!(%msg, "tick");
                    let stop = matches!(msg, PusherMsg::Stop);
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
        trace!("pusher done");
    }

    async fn handle(&mut self, msg: PusherMsg) {
        match msg {
            PusherMsg::Start { since, continuous } => {
                self.start(since, continuous);
                self.maybe_get_more_changes();
            }
            PusherMsg::HandleSubChanges(request) => {
                let sub: SubChanges = match request.decode_body() {
                    Ok(sub) => sub,
                    Err(err) => {
                        request.respond_err(err).await;
                        return;
                    }
                };
                request.respond_empty().await;
                debug!(since = sub.since, continuous = sub.continuous, "peer subscribed to changes");
                if let Some(batch) = sub.batch {
                    self.batch_size = batch as usize;
                }
                self.start(sub.since, sub.continuous);
                self.maybe_get_more_changes();
            }
            PusherMsg::GotChanges(result) => {
                self.getting_changes = false;
                match result {
                    Ok(rows) => self.got_changes(rows).await,
                    Err(err) => self.fail(err),
                }
            }
            PusherMsg::ChangesReplied { rows, result } => {
                self.change_lists_in_flight -= 1;
                match result {
                    Ok(data) => self.changes_replied(rows, data),
                    Err(err) => self.fail(err),
                }
                self.send_more_revs();
                self.maybe_get_more_changes();
                self.maybe_finished().await;
            }
            PusherMsg::RevReplied { sequence, result } => {
                self.revisions_in_flight -= 1;
                match result {
                    Err(err) if err.is_transient() => self.fail(err),
                    Err(err) => {
                        // A per-document rejection; record it and move on so
                        // the checkpoint can advance.
                        warn!(sequence, %err, "peer rejected revision");
                        self.mark_complete(sequence);
                    }
                    Ok(()) => self.mark_complete(sequence),
                }
                self.send_more_revs();
                self.maybe_finished().await;
            }
            PusherMsg::ChangesNotified => {
                if self.caught_up {
                    self.caught_up = false;
                }
                self.maybe_get_more_changes();
            }
            PusherMsg::Stop => {
                debug!("pusher stopping");
            }
        }
    }

    fn start(&mut self, since: u64, continuous: bool) {
        self.started = true;
        self.continuous = continuous;
        self.last_sequence = since;
        self.last_sequence_read = since;
        self.pending.clear(since);
    }

    async fn got_changes(&mut self, rows: Vec<ChangeItem>) {
        if rows.len() < self.batch_size {
            self.caught_up = true;
            debug!(last_sequence_read = self.last_sequence_read, "caught up with the change feed");
            if self.continuous && !self.subscribed {
                self.subscribe_to_changes().await;
            }
        }
        if let Some(last) = rows.last() {
            self.last_sequence_read = last.sequence;
        }
        for row in &rows {
            self.pending.insert(row.sequence);
        }

        if !rows.is_empty() {
            self.send_change_list(rows);
        }
        if self.caught_up && !self.caught_up_sent {
            // An empty changes message tells the peer the backlog has been
            // fully announced.
            self.caught_up_sent = true;
            self.send_change_list(Vec::new());
        }
        self.maybe_get_more_changes();
        self.maybe_finished().await;
    }

    fn send_change_list(&mut self, rows: Vec<ChangeItem>) {
        self.change_lists_in_flight += 1;
        let wire_rows: Vec<ChangeRow> = rows
            .iter()
            .map(|row| {
                ChangeRow(
                    row.sequence,
                    row.doc_id.clone(),
                    row.rev_id.to_string(),
                    row.deleted,
                    row.body_size,
                )
            })
            .collect();
        let conn = self.conn.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = conn.request(Profile::Changes, &wire_rows).await;
            let _ = tx.send(PusherMsg::ChangesReplied { rows, result }).await;
        });
    }

    fn changes_replied(&mut self, rows: Vec<ChangeItem>, data: ResponseData) {
        let answers: Vec<ChangeAnswer> = match data.decode_body() {
            Ok(answers) => answers,
            Err(_) if data.body.is_empty() => Vec::new(),
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        if answers.len() != rows.len() {
            warn!(
                rows = rows.len(),
                answers = answers.len(),
                "changes response row count mismatch"
            );
        }
        let mut answers = answers.into_iter();
        for row in rows {
            // A row the peer did not answer counts as not wanted, so its
            // sequence cannot stall the checkpoint.
            match answers.next().as_ref().and_then(ChangeAnswer::wanted) {
                None => self.mark_complete(row.sequence),
                Some(ancestors) => {
                    self.revs_to_send.push_back(RevToSend {
                        sequence: row.sequence,
                        doc_id: row.doc_id,
                        rev_id: row.rev_id,
                        known_ancestors: ancestors.to_vec(),
                    });
                }
            }
        }
    }

    fn send_more_revs(&mut self) {
        while self.revisions_in_flight < MAX_REVS_IN_FLIGHT {
            let Some(item) = self.revs_to_send.pop_front() else {
                break;
            };
            self.revisions_in_flight += 1;
            self.send_revision(item);
        }
    }

    fn send_revision(&self, item: RevToSend) {
        let db = self.db.clone();
        let conn = self.conn.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let sequence = item.sequence;
            let result = send_revision_inner(db, conn, item).await;
            let _ = tx.send(PusherMsg::RevReplied { sequence, result }).await;
        });
    }

    fn maybe_get_more_changes(&mut self) {
        if self.finished
            || !self.started
            || self.getting_changes
            || self.caught_up
            || self.change_lists_in_flight >= MAX_CHANGE_LISTS_IN_FLIGHT
        {
            return;
        }
        self.getting_changes = true;
        let db = self.db.clone();
        let tx = self.tx.clone();
        let since = self.last_sequence_read;
        let limit = self.batch_size;
        tokio::spawn(async move {
            let result = db.get_changes(since, limit).await;
            let _ = tx.send(PusherMsg::GotChanges(result)).await;
        });
    }

    async fn subscribe_to_changes(&mut self) {
        self.subscribed = true;
        let (notify_tx, notify_rx) = flume::unbounded();
        if let Err(err) = self.db.subscribe_changes(notify_tx).await {
            warn!(%err, "change subscription failed");
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while notify_rx.recv_async().await.is_ok() {
                if tx.send(PusherMsg::ChangesNotified).await.is_err() {
                    break;
                }
            }
        });
    }

    /// A revision send finished; its sequence leaves the pending set and the
    /// checkpoint follows the set's low-water mark.
    fn mark_complete(&mut self, sequence: u64) {
        if !self.pending.remove(sequence) {
            warn!(sequence, "sequence acknowledged twice");
            return;
        }
        let completed = self.pending.completed_through();
        if completed != self.last_sequence {
            trace!(from = self.last_sequence, to = completed, "checkpoint advances");
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
                let _ = self.events.send(Event::PushCheckpoint(self.last_sequence));
            }
            Err(err) => warn!(%err, "checkpoint save failed"),
        }
    }

    async fn maybe_finished(&mut self) {
        if self.finished || !self.started {
            return;
        }
        let idle = self.caught_up
            && !self.getting_changes
            && self.pending.is_empty()
            && self.revs_to_send.is_empty()
            && self.change_lists_in_flight == 0
            && self.revisions_in_flight == 0;
        if !idle {
            return;
        }
        if self.continuous {
            if !self.caught_up_event_sent {
                self.caught_up_event_sent = true;
                let _ = self.events.send(Event::PushCaughtUp);
            }
        } else {
            self.save_checkpoint_if_dirty().await;
            debug!(checkpoint = self.last_sequence, "push complete");
            let _ = self.events.send(Event::PushComplete {
                checkpoint: self.last_sequence,
            });
            self.finished = true;
        }
    }

    fn fail(&mut self, err: Error) {
        warn!(%err, "push failed");
        let _ = self.events.send(Event::PushFailed(err));
        self.finished = true;
    }
}

impl std::fmt::Debug for Pusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pusher")
            .field("last_sequence", &self.last_sequence)
            .field("pending", &self.pending.len())
            .field("caught_up", &self.caught_up)
            .field("change_lists_in_flight", &self.change_lists_in_flight)
            .field("revisions_in_flight", &self.revisions_in_flight)
            .finish()
    }
}

async fn send_revision_inner(db: DbHandle, conn: Connection, item: RevToSend) -> Result<()> {
    let data = db
        .read_revision(
            item.doc_id.clone(),
            item.rev_id.clone(),
            MAX_POSSIBLE_ANCESTORS_TO_SEND,
        )
        .await?;

    // Send ancestry back to the first revision the peer already knows.
    let mut history = Vec::new();
    for ancestor in &data.history {
        let text = ancestor.to_string();
        let known = item.known_ancestors.contains(&text);
        history.push(text);
        if known {
            break;
        }
    }

    let (payload, compressed) = protocol::maybe_compress(data.body)?;
    let header = RevHeader {
        id: data.doc_id,
        rev: data.rev_id.to_string(),
        sequence: item.sequence,
        deleted: data.deleted,
        history,
    };
    let body = protocol::encode_body(&header)?;
    conn.send_request(Profile::Rev, body, payload, compressed)
        .await?;
    Ok(())
}
