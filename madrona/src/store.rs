//! The storage-engine contract consumed by the document layer.
//!
//! The engine is an ordered key/value store with a monotonic sequence
//! assigned on every successful put. Documents are enumerable both by id and
//! by sequence; a side table of "local" records (never sequenced, never
//! replicated) holds replication checkpoints. Mutations happen inside a
//! scoped [`StoreTransaction`], which aborts when dropped without an
//! explicit commit.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

use crate::document::DocFlags;
use crate::error::Result;
use crate::revid::RevId;

pub mod memory;

/// One stored document record.
#[derive(Debug, Clone)]
pub struct Record {
    pub doc_id: String,
    /// The serialized revision tree.
    pub body: Bytes,
    pub sequence: u64,
    pub flags: DocFlags,
    /// The current revision at the time of the last save.
    pub rev_id: Option<RevId>,
}

/// Metadata written alongside a record body.
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    pub flags: DocFlags,
    pub rev_id: Option<RevId>,
}

/// Callback invoked with each newly committed sequence.
pub type ChangeObserver = Box<dyn Fn(u64) + Send + Sync + 'static>;

/// Removal handle returned by [`StorageEngine::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(pub(crate) u64);

/// The storage engine interface.
pub trait StorageEngine: Clone + Send + Sync + fmt::Debug + 'static {
    type Txn<'a>: StoreTransaction
    where
        Self: 'a;

    fn get(&self, doc_id: &str) -> Result<Option<Record>>;

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>>;

    /// Records with `sequence > since`, ascending, at most `limit`.
    fn enumerate_by_sequence(&self, since: u64, limit: usize) -> Result<Vec<Record>>;

    /// The most recently assigned sequence.
    fn last_sequence(&self) -> Result<u64>;

    fn begin_transaction(&self) -> Result<Self::Txn<'_>>;

    /// Reads a local (non-replicated, non-sequenced) record.
    fn get_local(&self, key: &str) -> Result<Option<Bytes>>;

    /// The expiration time assigned to a document, if any.
    fn expiration(&self, doc_id: &str) -> Result<Option<SystemTime>>;

    /// Registers a committed-sequence observer. Observers run after the
    /// commit completes, on the committing thread.
    fn add_observer(&self, observer: ChangeObserver) -> ObserverToken;

    fn remove_observer(&self, token: ObserverToken) -> bool;
}

/// A scoped mutation handle. Dropping without [`Self::commit`] aborts and
/// leaves the engine unchanged.
pub trait StoreTransaction {
    /// Writes a record and returns its newly assigned sequence.
    fn put(&mut self, doc_id: &str, body: Bytes, meta: RecordMeta) -> Result<u64>;

    /// Physically removes a record. Returns whether it existed.
    fn delete(&mut self, doc_id: &str) -> Result<bool>;

    /// Writes (`Some`) or clears (`None`) a local record.
    fn put_local(&mut self, key: &str, value: Option<Bytes>) -> Result<()>;

    fn set_expiration(&mut self, doc_id: &str, when: Option<SystemTime>) -> Result<()>;

    fn commit(self) -> Result<()>;
}
