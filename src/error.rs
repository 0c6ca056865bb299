//! Error types for the storage adapter.
//!
//! Every failure that reaches a caller is either [`ErrorKind::Temporary`]
//! (retrying may succeed) or [`ErrorKind::Permanent`] (configuration or
//! programming error). Remote failures are reported as [`ClientError`] and
//! classified at the call site closest to the remote invocation.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for remote capability calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// The two-kind failure taxonomy exposed to the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient failure, expected to succeed on retry.
    Temporary,
    /// Failure that will not resolve by itself.
    Permanent,
}

/// Main error type for the storage adapter.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient failure (connection acquisition, transport, timeouts).
    #[error("temporary storage failure: {0}")]
    Temporary(String),

    /// Failure implying a configuration or programming error.
    #[error("permanent storage failure: {0}")]
    Permanent(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The cluster did not agree on a single schema version in time.
    #[error("schema did not converge after {waited:?}: {versions:?}")]
    SchemaDisagreement {
        versions: BTreeMap<String, Vec<String>>,
        waited: Duration,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection pool has been shut down.
    #[error("connection pool is shut down")]
    PoolShutdown,
}

impl Error {
    /// Build a temporary error from a context string and a cause.
    pub fn temporary(context: &str, cause: impl std::fmt::Display) -> Self {
        Error::Temporary(format!("{}: {}", context, cause))
    }

    /// Build a permanent error from a context string and a cause.
    pub fn permanent(context: &str, cause: impl std::fmt::Display) -> Self {
        Error::Permanent(format!("{}: {}", context, cause))
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Temporary(_) | Error::SchemaDisagreement { .. } | Error::Cancelled => {
                ErrorKind::Temporary
            }
            Error::Permanent(_) | Error::Config(_) | Error::PoolShutdown => ErrorKind::Permanent,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_temporary(&self) -> bool {
        self.kind() == ErrorKind::Temporary
    }
}

/// Failures reported by the remote column store capability.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClientError {
    /// The requested keyspace, column family, row or column does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A schema object with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Nodes disagree on the schema version.
    #[error("schema disagreement")]
    SchemaDisagreement,

    /// Not enough replicas were available.
    #[error("unavailable")]
    Unavailable,

    /// The remote operation timed out.
    #[error("timed out")]
    TimedOut,

    /// Transport-level failure (connect, read, write).
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected or undecodable response.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether this failure is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::SchemaDisagreement
                | ClientError::Unavailable
                | ClientError::TimedOut
                | ClientError::Transport(_)
        )
    }

    /// Classify into the adapter taxonomy using the default policy.
    pub fn classify(self, context: &str) -> Error {
        if self.is_transient() {
            Error::temporary(context, self)
        } else {
            Error::permanent(context, self)
        }
    }
}

/// TCP transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame exceeded the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

impl From<NetworkError> for ClientError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Serialization(msg) => ClientError::Protocol(msg),
            NetworkError::FrameTooLarge { .. } => ClientError::Protocol(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::Temporary("x".into()).is_temporary());
        assert!(Error::Cancelled.is_temporary());
        assert!(!Error::Config("bad".into()).is_temporary());
        assert_eq!(Error::PoolShutdown.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_client_error_classification() {
        let err = ClientError::Transport("reset".into()).classify("batch_mutate");
        assert!(err.is_temporary());
        assert!(err.to_string().contains("batch_mutate"));

        let err = ClientError::InvalidRequest("bad cf".into()).classify("add_column_family");
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_network_error_conversion() {
        let err: ClientError = NetworkError::ConnectionClosed.into();
        assert!(err.is_transient());

        let err: ClientError = NetworkError::FrameTooLarge { size: 10, limit: 5 }.into();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
