//! Bidirectional replication between madrona stores.
//!
//! Two cooperating state machines share one framed connection: the
//! [pusher](pusher) announces local changes and streams requested revision
//! bodies; the [puller](puller) subscribes to the peer's changes and writes
//! what it receives through the [DB actor](db::DbHandle). Progress in each
//! direction is a durable checkpoint sequence that advances along the
//! low-water mark of a sparse pending set, so a crash resumes exactly after
//! the last fully transferred change.
//!
//! Transports plug in at the frame level; [`ws`] binds a connection onto a
//! WebSocket.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod connection;
pub mod db;
pub mod protocol;
pub(crate) mod puller;
pub(crate) mod pusher;
pub mod replicator;
pub mod ws;

pub use self::connection::{Connection, ConnectionOptions, InboundRequest, ResponseData};
pub use self::db::{ChangeItem, DbHandle, IncomingRev, RevisionData};
pub use self::pusher::{
    DEFAULT_CHANGE_BATCH_SIZE, MAX_CHANGE_LISTS_IN_FLIGHT, MAX_POSSIBLE_ANCESTORS_TO_SEND,
    MAX_REVS_IN_FLIGHT,
};
pub use self::replicator::{run_with_retries, Connector, Event, Mode, Options, Replicator};
