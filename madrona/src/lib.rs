//! An embeddable document database with per-document revision histories.
//!
//! Documents are JSON-like bodies keyed by string id. Every revision a
//! document has ever had is kept in a [`RevTree`]: a tree of revision ids
//! linked to their parents, tracking conflict state, tombstones and body
//! retention. Trees serialize to a compact record format and are stored
//! through a pluggable [storage engine](store::StorageEngine) that assigns a
//! monotonic sequence to every save; sequences are the unit of replication
//! progress.
//!
//! The crate ships an [in-memory engine](store::memory::MemoryEngine).
//! Content-addressed attachments live in the companion `madrona-blobs`
//! crate, and bidirectional replication over a framed WebSocket protocol in
//! `madrona-repl`.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod document;
pub mod error;
pub mod revid;
pub mod revtree;
pub mod seqset;
pub mod store;

pub use self::document::{DocFlags, PutOutcome, PutRequest, VersionedDoc};
pub use self::error::{Domain, Error, ErrorCode, Result};
pub use self::revid::RevId;
pub use self::revtree::{Inserted, Rev, RevFlags, RevIndex, RevTree};
pub use self::seqset::SequenceSet;
