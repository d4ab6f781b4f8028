//! In-memory storage engine.
//!
//! Transactions copy the whole state on begin and swap it back on commit, so
//! aborts are free and readers never see partial writes. Suited to tests and
//! small embedded data sets.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::store::{
    ChangeObserver, ObserverToken, Record, RecordMeta, StorageEngine, StoreTransaction,
};

#[derive(Debug, Clone, Default)]
struct StoredDoc {
    body: Bytes,
    sequence: u64,
    meta: RecordMeta,
    expiration: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    by_sequence: BTreeMap<u64, String>,
    local: BTreeMap<String, Bytes>,
    last_sequence: u64,
}

type Observers = HashMap<u64, ChangeObserver>;

/// The in-memory engine. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<RwLock<Inner>>,
    observers: Arc<RwLock<Observers>>,
    next_observer_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryEngine")
            .field("docs", &inner.docs.len())
            .field("last_sequence", &inner.last_sequence)
            .finish()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(doc_id: &str, doc: &StoredDoc) -> Record {
        Record {
            doc_id: doc_id.to_string(),
            body: doc.body.clone(),
            sequence: doc.sequence,
            flags: doc.meta.flags,
            rev_id: doc.meta.rev_id.clone(),
        }
    }

    fn notify(&self, sequences: &[u64]) {
        let observers = self.observers.read();
        for seq in sequences {
            for observer in observers.values() {
                observer(*seq);
            }
        }
    }
}

impl StorageEngine for MemoryEngine {
    type Txn<'a> = MemoryTransaction<'a>;

    fn get(&self, doc_id: &str) -> Result<Option<Record>> {
        let inner = self.inner.read();
        Ok(inner.docs.get(doc_id).map(|d| Self::record(doc_id, d)))
    }

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>> {
        let inner = self.inner.read();
        Ok(inner
            .by_sequence
            .get(&sequence)
            .and_then(|id| inner.docs.get(id).map(|d| Self::record(id, d))))
    }

    fn enumerate_by_sequence(&self, since: u64, limit: usize) -> Result<Vec<Record>> {
        let inner = self.inner.read();
        Ok(inner
            .by_sequence
            .range(since + 1..)
            .take(limit)
            .filter_map(|(_, id)| inner.docs.get(id).map(|d| Self::record(id, d)))
            .collect())
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.inner.read().last_sequence)
    }

    fn begin_transaction(&self) -> Result<Self::Txn<'_>> {
        let staged = self.inner.read().clone();
        Ok(MemoryTransaction {
            engine: self,
            staged,
            new_sequences: Vec::new(),
            committed: false,
        })
    }

    fn get_local(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.inner.read().local.get(key).cloned())
    }

    fn expiration(&self, doc_id: &str) -> Result<Option<SystemTime>> {
        Ok(self
            .inner
            .read()
            .docs
            .get(doc_id)
            .and_then(|d| d.expiration))
    }

    fn add_observer(&self, observer: ChangeObserver) -> ObserverToken {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.write().insert(id, observer);
        ObserverToken(id)
    }

    fn remove_observer(&self, token: ObserverToken) -> bool {
        self.observers.write().remove(&token.0).is_some()
    }
}

/// A pending set of mutations against a [`MemoryEngine`].
pub struct MemoryTransaction<'a> {
    engine: &'a MemoryEngine,
    staged: Inner,
    new_sequences: Vec<u64>,
    committed: bool,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn put(&mut self, doc_id: &str, body: Bytes, meta: RecordMeta) -> Result<u64> {
        self.staged.last_sequence += 1;
        let sequence = self.staged.last_sequence;
        if let Some(previous) = self.staged.docs.get(doc_id) {
            self.staged.by_sequence.remove(&previous.sequence);
        }
        let expiration = self
            .staged
            .docs
            .get(doc_id)
            .and_then(|d| d.expiration);
        self.staged.docs.insert(
            doc_id.to_string(),
            StoredDoc {
                body,
                sequence,
                meta,
                expiration,
            },
        );
        self.staged
            .by_sequence
            .insert(sequence, doc_id.to_string());
        self.new_sequences.push(sequence);
        Ok(sequence)
    }

    fn delete(&mut self, doc_id: &str) -> Result<bool> {
        match self.staged.docs.remove(doc_id) {
            Some(doc) => {
                self.staged.by_sequence.remove(&doc.sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put_local(&mut self, key: &str, value: Option<Bytes>) -> Result<()> {
        match value {
            Some(value) => {
                self.staged.local.insert(key.to_string(), value);
            }
            None => {
                self.staged.local.remove(key);
            }
        }
        Ok(())
    }

    fn set_expiration(&mut self, doc_id: &str, when: Option<SystemTime>) -> Result<()> {
        let doc = self
            .staged
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| Error::not_found(format!("no document {doc_id:?}")))?;
        doc.expiration = when;
        Ok(())
    }

    fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let new_sequences = std::mem::take(&mut self.new_sequences);
        *self.engine.inner.write() = staged;
        self.committed = true;
        self.engine.notify(&new_sequences);
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            trace!("transaction aborted");
        }
    }
}
