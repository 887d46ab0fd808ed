//! Verify command implementation.

use super::open_read_only;
use crate::error::{CliError, CliResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tablesync_core::rusqlite::Connection;
use tablesync_core::CoreError;
use tablesync_replication::{NodeId, Statement, Timestamp, UpdateState, LOG_TABLE};

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Records per state.
    pub pending: usize,
    /// Records applied.
    pub applied: usize,
    /// Records parked after exhausting their attempts.
    pub failed: usize,
    /// Number of emitting nodes seen.
    pub origins: usize,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// True when no problem was found. Parked records are not problems.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct StoredRecord {
    timestamp: Timestamp,
    index: u64,
    state: UpdateState,
    statement: Vec<u8>,
}

/// Checks the replication log of the database at `path`.
pub fn check(path: &Path) -> CliResult<VerifyResult> {
    let conn = open_read_only(path)?;
    let exists = tablesync_core::migration::list_tables(&conn)?
        .iter()
        .any(|t| t == LOG_TABLE);
    if !exists {
        return Err(CliError::NoReplicationLog(path.to_path_buf()));
    }
    Ok(check_connection(&conn)?)
}

fn check_connection(conn: &Connection) -> Result<VerifyResult, CoreError> {
    let mut result = VerifyResult::default();
    let mut by_origin: BTreeMap<NodeId, Vec<StoredRecord>> = BTreeMap::new();

    let mut stmt = conn.prepare(&format!(
        "SELECT node_id, node_index, timestamp, state, statement FROM {LOG_TABLE} \
         ORDER BY node_id, node_index"
    ))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        result.records_checked += 1;
        let node: NodeId = row.get(0)?;
        let record = StoredRecord {
            index: row.get(1)?,
            timestamp: row.get(2)?,
            state: row.get(3)?,
            statement: row.get(4)?,
        };
        match record.state {
            UpdateState::Pending => result.pending += 1,
            UpdateState::Applied => result.applied += 1,
            UpdateState::Failed => result.failed += 1,
        }
        by_origin.entry(node).or_default().push(record);
    }
    result.origins = by_origin.len();

    for (node, records) in &by_origin {
        let mut expected = 1;
        let mut previous: Option<&StoredRecord> = None;
        for record in records {
            if record.index == 0 {
                result.errors.push(format!("{node}: record with index 0"));
            } else if record.index > expected {
                result
                    .errors
                    .push(format!("{node}: missing indexes {expected}..={}", record.index - 1));
            }
            expected = record.index + 1;

            if let Some(previous) = previous {
                if record.timestamp <= previous.timestamp {
                    result.errors.push(format!(
                        "{node}: index {} has timestamp {} not after index {} at {}",
                        record.index, record.timestamp, previous.index, previous.timestamp
                    ));
                }
            }
            previous = Some(record);

            match Statement::from_cbor(&record.statement) {
                Ok(statement) => {
                    if let Err(e) = statement.validate() {
                        result.errors.push(format!("{node}#{}: {e}", record.index));
                    }
                }
                Err(e) => result
                    .errors
                    .push(format!("{node}#{}: undecodable statement: {e}", record.index)),
            }
        }
    }

    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let result = check(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(path, &result),
    }
    if result.is_ok() {
        Ok(())
    } else {
        Err(CliError::VerificationFailed(result.errors.len()))
    }
}

fn print_text_output(path: &Path, result: &VerifyResult) {
    println!("Verifying replication log at {path:?}");
    println!();
    println!(
        "  records checked: {}, origins: {}",
        result.records_checked, result.origins
    );
    println!(
        "  pending: {}, applied: {}, failed: {}",
        result.pending, result.applied, result.failed
    );
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
    println!();
    if result.is_ok() {
        println!("Replication log verification passed");
    } else {
        println!("Replication log verification failed");
    }
}
