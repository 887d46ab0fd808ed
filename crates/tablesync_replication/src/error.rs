//! Error types for replication.

use crate::record::UpdateState;
use tablesync_core::CoreError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while logging, shipping or replaying updates.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The store rejected an update record.
    #[error("failed to write update record: {0}")]
    Write(#[source] CoreError),

    /// Error from the executor or schema layer.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Error from the storage engine outside the executor.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Record or batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A record is malformed.
    #[error("invalid update record: {0}")]
    InvalidRecord(String),

    /// No record with this origin and index.
    #[error("no update record {index} from node {node}")]
    RecordNotFound {
        /// Emitting node.
        node: String,
        /// Per-node index.
        index: u64,
    },

    /// Attempted state change is not allowed.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: UpdateState,
        /// Attempted target state.
        to: UpdateState,
    },

    /// Peer transport failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },
}

impl ReplicationError {
    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Core(CoreError::Timeout { .. }) => true,
            _ => false,
        }
    }
}
