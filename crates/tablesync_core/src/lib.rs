//! # TableSync Core
//!
//! Keeps in-memory object graphs consistent with an embedded SQLite store.
//!
//! This crate provides:
//! - Declarative table schemas with additive migration and guard triggers
//! - The [`TableSynchronizer`] callback contract, one per entity type
//! - Change capture through SQLite's native update/commit/rollback hooks
//! - The [`ChangeQueueExecutor`], which owns the connection and drains
//!   captured changes into synchronizer callbacks
//! - The [`SyncRegistry`], which bootstraps tables in rank order and routes
//!   events to their synchronizers
//!
//! ## Key Invariants
//!
//! - Hooks only enqueue; rows are re-queried in the drain, never in a hook
//! - Events for one row reach its synchronizer in commit order
//! - Rolled back changes are never delivered
//! - Schema migration is additive only; anything else is a fatal
//!   configuration error
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = Arc::new(SyncRegistry::new());
//! registry.add_table_synchronizer("10", Arc::new(Stops::default()))?;
//!
//! let executor = ChangeQueueExecutor::new(ExecutorConfig::at("app.db"), registry);
//! executor.initialize()?;
//! executor.exec_update("INSERT INTO stops (id, name) VALUES (?1, ?2)", (1, "Central"), false)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod error;
mod executor;
mod guard;
pub mod migration;
mod registry;
mod schema;
mod synchronizer;
mod value;

pub use change_feed::{ChangeEvent, EventQueue, EventSink, Operation};
pub use config::ExecutorConfig;
pub use error::{CoreError, CoreResult};
pub use executor::{ChangeQueueExecutor, ExecutorHandle, Guards};
pub use guard::{BypassScope, GuardBypass, GUARD_BYPASS_FUNCTION};
pub use migration::{materialize_schema, LiveColumn, MaterializeReport, MigrationOperation, TableInfo};
pub use registry::{BootstrapReport, Dispatch, SyncRegistry, TableBootstrap, TableId};
pub use schema::{quote_ident, ColumnSpec, ColumnType, IndexSpec, SchemaDescriptor};
pub use synchronizer::{fetch_all, fetch_row, CallbackError, CallbackResult, TableSynchronizer};
pub use value::{Row, Value};

/// Re-exported so consumers can name parameter and connection types without
/// depending on `rusqlite` directly.
pub use rusqlite;
