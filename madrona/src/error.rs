//! The error taxonomy shared by the store, the blob store and the replicator.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Which subsystem an [`Error`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Errors raised by this library itself. Codes are [`ErrorCode`] values.
    Internal,
    /// Operating system errors. Codes are `errno` values.
    Posix,
    /// Errors surfaced by the underlying storage engine.
    Storage,
    /// Errors surfaced by a SQL storage engine.
    Sql,
    /// HTTP statuses carried as errors.
    Http,
    /// Network-level failures (DNS, TLS, connect).
    Network,
    /// WebSocket close codes and protocol violations.
    WebSocket,
}

/// Error codes in the [`Domain::Internal`] domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    AssertionFailed = 1,
    Unimplemented,
    NoSequences,
    UnsupportedEncryption,
    BadRevisionId,
    BadVersionVector,
    CorruptRevisionData,
    CorruptIndexData,
    TokenizerError,
    NotFound,
    Conflict,
    BadDocId,
    RemoteError,
}

/// Codes in the [`Domain::Network`] domain.
pub mod network {
    pub const DNS_FAILURE: i32 = 1;
    pub const UNKNOWN_HOST: i32 = 2;
    pub const TLS_CLIENT_CERT_REJECTED: i32 = 3;
    pub const CONNECTION_RESET: i32 = 4;
    pub const TIMEOUT: i32 = 5;
}

/// A `(domain, code)` tagged error with a human-readable message.
///
/// Every fallible operation in the workspace returns this type or wraps it.
/// Assertion failures (violations of documented invariants) are not
/// represented here; those panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("[{domain:?} {code}] {message}")]
pub struct Error {
    pub domain: Domain,
    pub code: i32,
    pub message: String,
}

impl Error {
    pub fn new(domain: Domain, code: i32, message: impl fmt::Display) -> Self {
        Error {
            domain,
            code,
            message: message.to_string(),
        }
    }

    pub fn internal(code: ErrorCode, message: impl fmt::Display) -> Self {
        Error::new(Domain::Internal, code as i32, message)
    }

    pub fn bad_revision_id(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::BadRevisionId, message)
    }

    pub fn bad_doc_id(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::BadDocId, message)
    }

    pub fn not_found(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::Conflict, message)
    }

    pub fn corrupt_revision_data(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::CorruptRevisionData, message)
    }

    pub fn corrupt_data(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::CorruptRevisionData, message)
    }

    pub fn storage(message: impl fmt::Display) -> Self {
        Error::new(Domain::Storage, 0, message)
    }

    pub fn network(code: i32, message: impl fmt::Display) -> Self {
        Error::new(Domain::Network, code, message)
    }

    pub fn websocket(code: i32, message: impl fmt::Display) -> Self {
        Error::new(Domain::WebSocket, code, message)
    }

    pub fn remote(message: impl fmt::Display) -> Self {
        Error::internal(ErrorCode::RemoteError, message)
    }

    /// The internal error code, if this error is in the internal domain.
    pub fn internal_code(&self) -> Option<ErrorCode> {
        if self.domain != Domain::Internal {
            return None;
        }
        use ErrorCode::*;
        let codes = [
            AssertionFailed,
            Unimplemented,
            NoSequences,
            UnsupportedEncryption,
            BadRevisionId,
            BadVersionVector,
            CorruptRevisionData,
            CorruptIndexData,
            TokenizerError,
            NotFound,
            Conflict,
            BadDocId,
            RemoteError,
        ];
        codes.into_iter().find(|c| *c as i32 == self.code)
    }

    /// HTTP status equivalent, used by document insertion and the wire level.
    pub fn http_status(&self) -> u16 {
        match self.domain {
            Domain::Http => self.code as u16,
            Domain::Internal => match self.internal_code() {
                Some(ErrorCode::BadRevisionId) | Some(ErrorCode::BadDocId) => 400,
                Some(ErrorCode::NotFound) => 404,
                Some(ErrorCode::Conflict) => 409,
                _ => 500,
            },
            _ => 500,
        }
    }

    /// Whether a replicator in continuous mode should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self.domain, Domain::Network | Domain::WebSocket)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let code = err.raw_os_error().unwrap_or(0);
        Error::new(Domain::Posix, code, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::corrupt_revision_data(err)
    }
}

/// Workspace-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
