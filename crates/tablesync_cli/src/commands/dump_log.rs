//! Dump-log command implementation.

use super::open_node;
use crate::error::CliResult;
use std::path::Path;
use tablesync_replication::{Statement, Timestamp, UpdateRecord};

/// Options for the dump-log command.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Lower timestamp bound, in milliseconds.
    pub after: u64,
    /// Include records at exactly `after`.
    pub inclusive: bool,
    /// Maximum number of records.
    pub limit: Option<usize>,
}

/// Reads the requested slice of the log.
pub fn read_records(path: &Path, options: &DumpOptions) -> CliResult<Vec<UpdateRecord>> {
    let node = open_node(path, None)?;
    let records = node
        .log()
        .load_all_after_timestamp(Timestamp::from_millis(options.after), options.inclusive)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Runs the dump-log command.
pub fn run(path: &Path, options: &DumpOptions, format: &str) -> CliResult<()> {
    let records = read_records(path, options)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => print_text_output(&records),
    }
    Ok(())
}

fn print_text_output(records: &[UpdateRecord]) {
    println!(
        "{:<15} {:<36} {:>8} {:<8} {:>3}  STATEMENT",
        "TIMESTAMP", "NODE", "INDEX", "STATE", "TRY"
    );
    for record in records {
        println!(
            "{:<15} {:<36} {:>8} {:<8} {:>3}  {}",
            record.timestamp.to_string(),
            record.emitting_node.to_string(),
            record.index,
            record.state.to_string(),
            record.attempts,
            describe(&record.statement)
        );
        if let Some(error) = &record.last_error {
            println!("{:>74}last error: {error}", "");
        }
    }
    println!();
    println!("{} record(s)", records.len());
}

/// One-line summary of a statement.
pub fn describe(statement: &Statement) -> String {
    match statement {
        Statement::Upsert { table, key_column, row } => {
            let key = row.get(key_column).map(|v| format!("{v:?}")).unwrap_or_default();
            format!("UPSERT {table} {key_column}={key} ({} columns)", row.len())
        }
        Statement::Delete {
            table,
            key_column,
            row_id,
        } => format!("DELETE {table} {key_column}={row_id}"),
        Statement::Sql { sql } => {
            let line = sql.lines().next().unwrap_or_default();
            if line.chars().count() > 60 {
                format!("SQL {}...", line.chars().take(60).collect::<String>())
            } else {
                format!("SQL {line}")
            }
        }
    }
}
