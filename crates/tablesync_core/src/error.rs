//! Error types for TableSync core.

use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in TableSync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The live table disagrees with its descriptor beyond what an additive
    /// migration can fix.
    #[error("schema mismatch on table {table}, column {column}: {message}")]
    SchemaMismatch {
        /// The offending table.
        table: String,
        /// The offending column.
        column: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A schema descriptor is malformed.
    #[error("invalid schema for table {table}: {message}")]
    InvalidSchema {
        /// Table the descriptor describes.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// A synchronizer was registered after the executor was initialized.
    #[error("cannot register table {table}: registry is closed")]
    RegistrationClosed {
        /// Table of the rejected synchronizer.
        table: String,
    },

    /// A table name or rank was registered twice.
    #[error("duplicate registration: {message}")]
    DuplicateRegistration {
        /// Which key collided.
        message: String,
    },

    /// No synchronizer is registered for the table.
    #[error("no synchronizer registered for table {table}")]
    NotFound {
        /// Name of the table.
        table: String,
    },

    /// A synchronous write gave up waiting for its events to drain.
    #[error("timed out after {waited:?} waiting for change events to drain")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The executor has not been initialized yet.
    #[error("executor is not initialized")]
    NotInitialized,

    /// The executor was initialized twice.
    #[error("executor is already initialized")]
    AlreadyInitialized,

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a schema mismatch error.
    pub fn schema_mismatch(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(table: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors that must stop startup.
    ///
    /// Configuration errors are never retried or skipped: the descriptor or
    /// the process wiring has to be fixed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::SchemaMismatch { .. }
                | CoreError::InvalidSchema { .. }
                | CoreError::RegistrationClosed { .. }
                | CoreError::DuplicateRegistration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors() {
        assert!(CoreError::schema_mismatch("stops", "name", "type changed").is_configuration());
        assert!(CoreError::invalid_schema("stops", "no columns").is_configuration());
        assert!(!CoreError::not_found("stops").is_configuration());
        assert!(!CoreError::Closed.is_configuration());
    }

    #[test]
    fn mismatch_names_table_and_column() {
        let err = CoreError::schema_mismatch("stops", "name", "declared TEXT, found INTEGER");
        let msg = err.to_string();
        assert!(msg.contains("stops"));
        assert!(msg.contains("name"));
    }
}
