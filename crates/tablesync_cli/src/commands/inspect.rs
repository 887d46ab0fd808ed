//! Inspect command implementation.

use super::open_read_only;
use crate::error::CliResult;
use serde::Serialize;
use std::path::Path;
use tablesync_core::migration::{inspect_table, list_tables};
use tablesync_core::TableInfo;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Every table, by name.
    pub tables: Vec<TableInfo>,
}

/// Runs the inspect command.
pub fn run(path: &Path, table: Option<&str>, format: &str) -> CliResult<()> {
    let conn = open_read_only(path)?;
    let names = match table {
        Some(table) => vec![table.to_string()],
        None => list_tables(&conn)?,
    };
    let tables = names
        .iter()
        .map(|name| inspect_table(&conn, name))
        .collect::<Result<Vec<_>, _>>()?;

    let result = InspectResult {
        path: path.display().to_string(),
        tables,
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Database: {}", result.path);
    println!("Tables:   {}", result.tables.len());
    for table in &result.tables {
        println!();
        println!("{}", table.name);
        for column in &table.columns {
            let key = if column.primary_key { "  PRIMARY KEY" } else { "" };
            println!("  {:<24} {}{key}", column.name, column.declared_type);
        }
        if !table.indexes.is_empty() {
            println!("  indexes:  {}", table.indexes.join(", "));
        }
        if !table.guard_triggers.is_empty() {
            println!("  guards:   {}", table.guard_triggers.join(", "));
        }
    }
}
