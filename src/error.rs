//! Crate-wide error type.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! map onto how callers react: `TimedOut` and `Io` are node failures that
//! lookups retry against other candidates, `Malformed`/`BadSignature`/
//! `BadMessage` tear a signed stream down, `Aborted` is never retried.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Cancellation was triggered while the operation was in flight.
    #[error("operation aborted")]
    Aborted,

    /// The operation's deadline expired.
    #[error("operation timed out")]
    TimedOut,

    /// Bad bencode, chunk-extension syntax, header, or signature string.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// Cryptographic signature verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// A signed-stream invariant was violated.
    #[error("bad message: {0}")]
    BadMessage(&'static str),

    /// No provider, or no such cache entry.
    #[error("not found")]
    NotFound,

    /// Unknown algorithm or query type.
    #[error("unsupported {0}")]
    Unsupported(&'static str),

    /// Underlying socket or file error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a query that failed this way should be retried against
    /// another candidate node.
    pub fn is_node_failure(&self) -> bool {
        matches!(self, Error::TimedOut | Error::Io(_))
    }
}
