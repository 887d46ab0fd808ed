//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod replay;
pub mod verify;

use crate::error::{CliError, CliResult};
use std::path::Path;
use std::sync::Arc;
use tablesync_core::migration::list_tables;
use tablesync_core::rusqlite::{Connection, OpenFlags};
use tablesync_core::{ExecutorConfig, SyncRegistry};
use tablesync_replication::{NodeId, ReplicationConfig, ReplicationNode, LOG_TABLE};

/// Opens a database read-only, for inspection.
pub fn open_read_only(path: &Path) -> CliResult<Connection> {
    if !path.is_file() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(tablesync_core::CoreError::from)?;
    Ok(conn)
}

/// Opens a database that already holds a replication log.
///
/// With no `node`, the node id is random; reading and replaying do not
/// depend on it.
pub fn open_node(path: &Path, node: Option<NodeId>) -> CliResult<ReplicationNode> {
    let tables = list_tables(&open_read_only(path)?)?;
    if !tables.iter().any(|t| t == LOG_TABLE) {
        return Err(CliError::NoReplicationLog(path.to_path_buf()));
    }
    let config = ReplicationConfig::new(node.unwrap_or_else(NodeId::random));
    let node = ReplicationNode::open(config, ExecutorConfig::at(path), Arc::new(SyncRegistry::new()))?;
    Ok(node)
}
