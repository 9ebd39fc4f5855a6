//! Error types for the Satchel engine.

use crate::{remote::RemoteError, BoxName, Fingerprint, Seq, TypeId};
use thiserror::Error;

/// All possible errors from the Satchel engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors: caller bugs, never retried
    #[error("box not open: {0}")]
    BoxNotOpen(BoxName),

    #[error("codec not registered: {0}")]
    CodecNotRegistered(TypeId),

    #[error(
        "type id '{type_id}' is already bound to a different layout \
         (registered {registered:#010x}, offered {offered:#010x})"
    )]
    FingerprintConflict {
        type_id: TypeId,
        registered: Fingerprint,
        offered: Fingerprint,
    },

    // Encode-time validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Decode errors: recoverable only via explicit wipe-and-reopen
    #[error(
        "fingerprint mismatch for '{type_id}': stored {stored:#010x}, \
         registered {registered:#010x}"
    )]
    FingerprintMismatch {
        type_id: TypeId,
        stored: Fingerprint,
        registered: Fingerprint,
    },

    #[error("decode failed for '{type_id}': {reason}")]
    Decode { type_id: TypeId, reason: String },

    /// The backing segment could not be parsed on open. The engine never
    /// wipes on its own; recovery is an explicit wipe-and-reopen.
    #[error("corrupt segment for box '{name}': {reason}")]
    CorruptSegment { name: BoxName, reason: String },

    // Storage IO: fatal for the affected box
    #[error("storage io error: {0}")]
    Io(String),

    // Remote failures, classified transient/permanent by `RemoteError`
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("no outbox entry with seq {0}")]
    UnknownOutboxEntry(Seq),
}

impl Error {
    /// Whether this error is worth retrying (timeouts, network drops, 5xx).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Remote(e) if e.is_transient())
    }

    /// Whether this error is a caller bug rather than a runtime condition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::BoxNotOpen(_)
                | Error::CodecNotRegistered(_)
                | Error::FingerprintConflict { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
