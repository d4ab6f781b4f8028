//! Content-addressed storage for document attachments.
//!
//! Blobs are opaque byte strings identified by the SHA-1 of their contents
//! ([`BlobKey`]) and stored as individual files named after the key. Writes
//! stream into a temp file and install with an atomic rename; garbage
//! collection deletes everything outside an explicit in-use set. Stores can
//! transparently encrypt file contents, in which case keys still digest the
//! plaintext.

#![deny(rustdoc::broken_intra_doc_links)]

mod key;
mod store;

pub use self::key::{BlobKey, DIGEST_PREFIX, FILE_SUFFIX};
pub use self::store::{
    Blob, BlobReader, BlobStore, BlobWriteStream, EncryptionAlgorithm, Options,
};
