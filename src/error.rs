//! # Errors
//!
//! Errors raised by the handshake protocol. Validation errors are raised
//! before any context is opened; protocol and origin errors are fatal to the
//! current flow and are only returned after its contexts have been closed.

use thiserror::Error;

use crate::origin::Origin;

/// Result type for the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned by a credential flow.
#[derive(Debug, Error)]
pub enum Error {
    /// A required option is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A message arrived with an unexpected type or an invalid shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The counterpart context was closed, or the flow was cancelled, before
    /// it completed.
    #[error("operation aborted")]
    Aborted,

    /// A pending-operation record was written by a different origin than the
    /// live counterpart.
    #[error("origin mismatch: expected {expected}, found {found}")]
    OriginMismatch {
        /// The origin of the live counterpart.
        expected: Origin,
        /// The origin recorded with the pending operation.
        found: Origin,
    },

    /// No message arrived within the configured timeout.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The holder rejected the operation.
    #[error("remote error: {0}")]
    Remote(String),

    /// The host refused to open a context for the URL.
    #[error("context blocked: {0}")]
    ContextBlocked(String),

    /// The operation needs a context that is no longer open.
    #[error("context closed")]
    ContextClosed,

    /// A message payload could not be (de)serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A URL could not be parsed.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether the error is an abort, which outer operations may resolve as
    /// an empty result.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Shorthand for returning a protocol error.
macro_rules! protocol_err {
    ($($arg:tt)*) => {
        $crate::error::Error::Protocol(format!($($arg)*))
    };
}
pub(crate) use protocol_err;
