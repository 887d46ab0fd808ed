//! Errors reported by the CLI.

use std::path::PathBuf;
use tablesync_core::CoreError;
use tablesync_replication::ReplicationError;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that end a command.
#[derive(Error, Debug)]
pub enum CliError {
    /// No database at the given path.
    #[error("no database found at {0:?}")]
    NotFound(PathBuf),

    /// The database has no replication log.
    #[error("database at {0:?} has no replication log")]
    NoReplicationLog(PathBuf),

    /// A command-line value could not be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `verify` found problems.
    #[error("verification failed with {0} violation(s)")]
    VerificationFailed(usize),

    /// Error from the store.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Error from the replication layer.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Error writing JSON output.
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),
}
