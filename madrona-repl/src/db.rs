//! The DB actor: all storage access for a replication session runs on one
//! dedicated thread, keyed off a mailbox of actions. Both directions of the
//! replicator talk to the store exclusively through a [`DbHandle`].

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{error, error_span, trace, warn};

use madrona::store::{StorageEngine, StoreTransaction};
use madrona::{Error, PutRequest, Result, RevId, VersionedDoc};
use madrona_blobs::{BlobKey, BlobStore};

/// One row of a changes feed.
#[derive(Debug, Clone)]
pub struct ChangeItem {
    pub sequence: u64,
    pub doc_id: String,
    pub rev_id: RevId,
    pub deleted: bool,
    pub body_size: u64,
}

/// A materialized revision, ready to send to a peer.
#[derive(Debug, Clone)]
pub struct RevisionData {
    pub doc_id: String,
    pub rev_id: RevId,
    pub sequence: u64,
    pub deleted: bool,
    /// Ancestor revision ids, nearest first, excluding the revision itself.
    pub history: Vec<RevId>,
    pub body: Bytes,
}

/// A revision received from a peer, to be written through the store.
#[derive(Debug, Clone)]
pub struct IncomingRev {
    pub doc_id: String,
    /// The revision id first, followed by its ancestry newest-to-oldest.
    pub history: Vec<RevId>,
    pub body: Option<Bytes>,
    pub deleted: bool,
}

#[derive(derive_more::Debug, strum::Display)]
enum Action {
    GetChanges {
        since: u64,
        limit: usize,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<ChangeItem>>>,
    },
    ReadRevision {
        doc_id: String,
        rev_id: RevId,
        max_history: usize,
        #[debug("reply")]
        reply: oneshot::Sender<Result<RevisionData>>,
    },
    InsertRevision {
        rev: IncomingRev,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    FindNewRevisions {
        proposals: Vec<(String, RevId)>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<Option<Vec<RevId>>>>>,
    },
    GetCheckpoint {
        key: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<u64>>,
    },
    SetCheckpoint {
        key: String,
        sequence: u64,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    ReadAttachment {
        key: BlobKey,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Bytes>>,
    },
    SubscribeChanges {
        notify: flume::Sender<u64>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

const ACTION_CAP: usize = 128;

/// Handle to the DB actor thread.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: flume::Sender<Action>,
}

impl DbHandle {
    /// Spawns the actor over a storage engine and an optional blob store.
    /// `max_rev_tree_depth` bounds revision history on every save.
    pub fn spawn<S: StorageEngine>(
        engine: S,
        blobs: Option<Arc<BlobStore>>,
        max_rev_tree_depth: u32,
    ) -> DbHandle {
        let (tx, rx) = flume::bounded(ACTION_CAP);
        let mut actor = DbActor {
            engine,
            blobs,
            max_rev_tree_depth,
            action_rx: rx,
        };
        std::thread::spawn(move || {
            let span = error_span!("db_actor");
            let _enter = span.enter();
            if let Err(err) = actor.run() {
                error!("db actor closed with error: {err:?}");
            }
        });
        DbHandle { tx }
    }

    pub async fn get_changes(&self, since: u64, limit: usize) -> Result<Vec<ChangeItem>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetChanges { since, limit, reply }).await?;
        recv(rx).await
    }

    pub async fn read_revision(
        &self,
        doc_id: String,
        rev_id: RevId,
        max_history: usize,
    ) -> Result<RevisionData> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::ReadRevision {
            doc_id,
            rev_id,
            max_history,
            reply,
        })
        .await?;
        recv(rx).await
    }

    pub async fn insert_revision(&self, rev: IncomingRev) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::InsertRevision { rev, reply }).await?;
        recv(rx).await
    }

    /// For each proposed `(doc, rev)`, answers `None` when the revision is
    /// already known, otherwise the candidate ancestor ids to offer.
    pub async fn find_new_revisions(
        &self,
        proposals: Vec<(String, RevId)>,
    ) -> Result<Vec<Option<Vec<RevId>>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::FindNewRevisions { proposals, reply }).await?;
        recv(rx).await
    }

    pub async fn get_checkpoint(&self, key: String) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetCheckpoint { key, reply }).await?;
        recv(rx).await
    }

    pub async fn set_checkpoint(&self, key: String, sequence: u64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::SetCheckpoint { key, sequence, reply }).await?;
        recv(rx).await
    }

    pub async fn read_attachment(&self, key: BlobKey) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::ReadAttachment { key, reply }).await?;
        recv(rx).await
    }

    /// Registers a channel that receives every newly committed sequence.
    pub async fn subscribe_changes(&self, notify: flume::Sender<u64>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::SubscribeChanges { notify, reply }).await?;
        recv(rx).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send_async(Action::Shutdown).await;
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .map_err(|_| Error::storage("db actor is gone"))
    }
}

async fn recv<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.map_err(|_| Error::storage("db actor is gone"))?
}

struct DbActor<S: StorageEngine> {
    engine: S,
    blobs: Option<Arc<BlobStore>>,
    max_rev_tree_depth: u32,
    action_rx: flume::Receiver<Action>,
}

impl<S: StorageEngine> DbActor<S> {
    fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let Ok(action) = self.action_rx.recv() else {
                break;
            };
            trace!(%action, "tick");
            let is_shutdown = matches!(action, Action::Shutdown);
            if let Err(err) = self.on_action(action) {
                warn!("failed to send reply: {err}");
            }
            if is_shutdown {
                break;
            }
        }
        trace!("shutdown");
        Ok(())
    }

    fn on_action(&mut self, action: Action) -> anyhow::Result<()> {
        match action {
            Action::Shutdown => Ok(()),
            Action::GetChanges { since, limit, reply } => {
                send_reply(reply, self.get_changes(since, limit))
            }
            Action::ReadRevision {
                doc_id,
                rev_id,
                max_history,
                reply,
            } => send_reply(reply, self.read_revision(&doc_id, &rev_id, max_history)),
            Action::InsertRevision { rev, reply } => send_reply(reply, self.insert_revision(rev)),
            Action::FindNewRevisions { proposals, reply } => {
                send_reply(reply, self.find_new_revisions(proposals))
            }
            Action::GetCheckpoint { key, reply } => {
                send_reply(reply, self.get_checkpoint(&key))
            }
            Action::SetCheckpoint { key, sequence, reply } => {
                send_reply(reply, self.set_checkpoint(&key, sequence))
            }
            Action::ReadAttachment { key, reply } => {
                send_reply(reply, self.read_attachment(key))
            }
            Action::SubscribeChanges { notify, reply } => {
                self.engine.add_observer(Box::new(move |sequence| {
                    let _ = notify.send(sequence);
                }));
                send_reply(reply, Ok(()))
            }
        }
    }

    fn get_changes(&self, since: u64, limit: usize) -> Result<Vec<ChangeItem>> {
        let records = self.engine.enumerate_by_sequence(since, limit)?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let rev_id = record.rev_id?;
                Some(ChangeItem {
                    sequence: record.sequence,
                    doc_id: record.doc_id,
                    deleted: record.flags.contains(madrona::DocFlags::DELETED),
                    body_size: record.body.len() as u64,
                    rev_id,
                })
            })
            .collect())
    }

    fn read_revision(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        max_history: usize,
    ) -> Result<RevisionData> {
        let doc = VersionedDoc::get(&self.engine, doc_id, true)?;
        let tree = doc.tree();
        let index = tree
            .get(rev_id)
            .ok_or_else(|| Error::not_found(format!("revision {rev_id} of {doc_id:?} not found")))?;
        let rev = tree.rev(index);
        let body = rev.body().cloned().unwrap_or_default();
        let history = tree
            .history(index)
            .into_iter()
            .skip(1)
            .take(max_history)
            .map(|i| tree.rev(i).rev_id().clone())
            .collect();
        Ok(RevisionData {
            doc_id: doc_id.to_string(),
            rev_id: rev.rev_id().clone(),
            sequence: rev.sequence(),
            deleted: rev.is_deleted(),
            history,
            body,
        })
    }

    fn insert_revision(&self, rev: IncomingRev) -> Result<()> {
        let mut doc = VersionedDoc::get(&self.engine, &rev.doc_id, false)?;
        let outcome = doc.put(&PutRequest {
            body: rev.body,
            history: rev.history,
            existing: true,
            deleted: rev.deleted,
            foreign: true,
            ..Default::default()
        })?;
        if outcome.created {
            let mut txn = self.engine.begin_transaction()?;
            doc.save_in(&mut txn, self.max_rev_tree_depth)?;
            txn.commit()?;
            trace!(doc = %doc.doc_id(), rev = %outcome.rev_id, "inserted pulled revision");
        }
        Ok(())
    }

    fn find_new_revisions(
        &self,
        proposals: Vec<(String, RevId)>,
    ) -> Result<Vec<Option<Vec<RevId>>>> {
        proposals
            .into_iter()
            .map(|(doc_id, rev_id)| {
                let mut doc = VersionedDoc::get(&self.engine, &doc_id, false)?;
                if doc.tree().get(&rev_id).is_some() {
                    return Ok(None);
                }
                let ancestors = doc
                    .tree_mut()
                    .possible_ancestors(&rev_id)
                    .into_iter()
                    .map(|i| doc.tree().rev(i).rev_id().clone())
                    .collect();
                Ok(Some(ancestors))
            })
            .collect()
    }

    fn get_checkpoint(&self, key: &str) -> Result<u64> {
        match self.engine.get_local(key)? {
            None => Ok(0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::corrupt_data(format!("unreadable checkpoint {key:?}"))),
        }
    }

    fn set_checkpoint(&self, key: &str, sequence: u64) -> Result<()> {
        let mut txn = self.engine.begin_transaction()?;
        txn.put_local(key, Some(sequence.to_string().into_bytes().into()))?;
        txn.commit()?;
        trace!(key, sequence, "checkpoint saved");
        Ok(())
    }

    fn read_attachment(&self, key: BlobKey) -> Result<Bytes> {
        let blobs = self
            .blobs
            .as_ref()
            .ok_or_else(|| Error::not_found("no blob store attached"))?;
        let blob = blobs.get(key);
        if !blob.exists() {
            return Err(Error::not_found(format!("no blob {key}")));
        }
        blob.contents()
    }
}

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> anyhow::Result<()> {
    sender
        .send(value)
        .map_err(|_| anyhow::anyhow!("receiver dropped"))
        .context("reply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use madrona::store::memory::MemoryEngine;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    fn seed(engine: &MemoryEngine, doc_id: &str, rev_id: &str, body: &str) {
        let mut doc = VersionedDoc::get(engine, doc_id, false).unwrap();
        let mut history = vec![rev(rev_id)];
        if let Some(current) = doc.current_rev_id() {
            history.push(current);
        }
        doc.put(&PutRequest {
            body: Some(Bytes::from(body.to_string())),
            history,
            existing: true,
            ..Default::default()
        })
        .unwrap();
        doc.save(engine, 20).unwrap();
    }

    #[tokio::test]
    async fn changes_feed_and_revision_reads() {
        let engine = MemoryEngine::new();
        seed(&engine, "a", "1-aa", "{\"n\":1}");
        seed(&engine, "b", "1-bb", "{\"n\":2}");
        seed(&engine, "a", "2-cc", "{\"n\":3}");

        let db = DbHandle::spawn(engine, None, 20);
        let changes = db.get_changes(0, 100).await.unwrap();
        // "a" was rewritten at sequence 3, so only its latest shows up.
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id, "b");
        assert_eq!(changes[0].sequence, 2);
        assert_eq!(changes[1].doc_id, "a");
        assert_eq!(changes[1].rev_id, rev("2-cc"));

        let data = db
            .read_revision("a".into(), rev("2-cc"), 20)
            .await
            .unwrap();
        assert_eq!(data.body.as_ref(), b"{\"n\":3}");
        assert_eq!(data.history, vec![rev("1-aa")]);
        assert!(!data.deleted);

        let missing = db.read_revision("a".into(), rev("9-zz"), 20).await;
        assert_eq!(missing.unwrap_err().http_status(), 404);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn insert_and_dedup() {
        let engine = MemoryEngine::new();
        seed(&engine, "doc", "1-aa", "{}");
        let db = DbHandle::spawn(engine.clone(), None, 20);

        db.insert_revision(IncomingRev {
            doc_id: "doc".into(),
            history: vec![rev("2-bb"), rev("1-aa")],
            body: Some(Bytes::from_static(b"{\"v\":2}")),
            deleted: false,
        })
        .await
        .unwrap();

        let answers = db
            .find_new_revisions(vec![
                ("doc".into(), rev("2-bb")),
                ("doc".into(), rev("3-cc")),
                ("other".into(), rev("1-xx")),
            ])
            .await
            .unwrap();
        assert_eq!(answers[0], None);
        assert_eq!(answers[1], Some(vec![rev("2-bb")]));
        assert_eq!(answers[2], Some(vec![]));

        let mut doc = VersionedDoc::get(&engine, "doc", true).unwrap();
        assert_eq!(doc.current_rev_id().unwrap(), rev("2-bb"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn checkpoints_persist() {
        let engine = MemoryEngine::new();
        let db = DbHandle::spawn(engine, None, 20);
        assert_eq!(db.get_checkpoint("checkpoint/push".into()).await.unwrap(), 0);
        db.set_checkpoint("checkpoint/push".into(), 17).await.unwrap();
        assert_eq!(
            db.get_checkpoint("checkpoint/push".into()).await.unwrap(),
            17
        );
        db.shutdown().await;
    }

    #[tokio::test]
    async fn change_subscriptions_fire() {
        let engine = MemoryEngine::new();
        let db = DbHandle::spawn(engine.clone(), None, 20);
        let (tx, rx) = flume::unbounded();
        db.subscribe_changes(tx).await.unwrap();

        seed(&engine, "doc", "1-aa", "{}");
        let sequence = rx.recv_async().await.unwrap();
        assert_eq!(sequence, 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn attachments_come_from_the_blob_store() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(
            madrona_blobs::BlobStore::open(dir.path(), Default::default()).unwrap(),
        );
        let key = blobs.put(b"attachment bytes", None).unwrap();

        let db = DbHandle::spawn(MemoryEngine::new(), Some(blobs), 20);
        let data = db.read_attachment(key).await.unwrap();
        assert_eq!(data.as_ref(), b"attachment bytes");

        let missing = db.read_attachment(BlobKey::compute(b"nope")).await;
        assert_eq!(missing.unwrap_err().http_status(), 404);
        db.shutdown().await;
    }
}
