//! Schema materialization and additive migration.
//!
//! Migrations in TableSync are:
//! - **Descriptor-driven**: the live table is compared against its
//!   [`SchemaDescriptor`] on every start, no versioned scripts
//! - **Additive-only**: missing trailing columns and indexes are created;
//!   any other column change is a fatal [`CoreError::SchemaMismatch`], and
//!   an index whose columns or uniqueness changed is dropped and rebuilt
//! - **Idempotent**: a second run against a correct table executes no DDL
//!
//! Guard triggers are reconciled the same way: the expected set is derived
//! from the descriptor policy and compared with the live trigger text.

use crate::error::{CoreError, CoreResult};
use crate::guard::GUARD_BYPASS_FUNCTION;
use crate::schema::{quote_ident, quote_literal, ColumnSpec, ColumnType, SchemaDescriptor};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Prefix of every trigger the engine owns.
pub const GUARD_TRIGGER_PREFIX: &str = "tablesync_guard_";

/// A DDL operation performed while materializing a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOperation {
    /// Created the table.
    CreateTable {
        /// Table name.
        table: String,
    },
    /// Appended a column.
    AddColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Created an index.
    CreateIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },
    /// Dropped an index whose columns or uniqueness no longer match.
    DropIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },
    /// Created a guard trigger.
    CreateTrigger {
        /// Table name.
        table: String,
        /// Trigger name.
        trigger: String,
    },
    /// Dropped a stale guard trigger.
    DropTrigger {
        /// Table name.
        table: String,
        /// Trigger name.
        trigger: String,
    },
}

/// What a materialization pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// DDL operations in execution order.
    pub operations: Vec<MigrationOperation>,
}

impl MaterializeReport {
    /// Returns true if no DDL was executed.
    pub fn is_noop(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns true if the table was created by this pass.
    pub fn created_table(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, MigrationOperation::CreateTable { .. }))
    }

    /// Columns appended by this pass.
    pub fn added_columns(&self) -> Vec<&str> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                MigrationOperation::AddColumn { column, .. } => Some(column.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A column as it exists physically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveColumn {
    /// Column name.
    pub name: String,
    /// Declared type text.
    pub declared_type: String,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// Physical description of a table, for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Columns in physical order.
    pub columns: Vec<LiveColumn>,
    /// Index names.
    pub indexes: Vec<String>,
    /// Guard trigger names.
    pub guard_triggers: Vec<String>,
}

/// Creates or migrates the physical table for a descriptor.
///
/// # Errors
///
/// Returns `InvalidSchema` for a malformed descriptor, `SchemaMismatch`
/// when the live table cannot be reached by appending columns, and
/// `Storage` if a DDL statement fails.
pub fn materialize_schema(
    conn: &Connection,
    schema: &SchemaDescriptor,
    enable_triggers: bool,
) -> CoreResult<MaterializeReport> {
    schema.validate()?;
    let table = schema.table_name();
    let mut report = MaterializeReport::default();

    let live = live_columns(conn, table)?;
    if live.is_empty() {
        conn.execute_batch(&create_table_sql(schema))?;
        info!(table, columns = schema.columns().len(), "created table");
        report.operations.push(MigrationOperation::CreateTable {
            table: table.to_string(),
        });
    } else {
        check_live_columns(schema, &live)?;
        for column in &schema.columns()[live.len()..] {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(&column.name),
                column.column_type.sql_type()
            ))?;
            info!(table, column = %column.name, "added column");
            report.operations.push(MigrationOperation::AddColumn {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
    }

    let existing_indexes: HashSet<String> = index_names(conn, table)?.into_iter().collect();
    for index in schema.indexes() {
        if existing_indexes.contains(&index.name) {
            let (unique, columns) = live_index(conn, table, &index.name)?;
            let same_columns = columns.len() == index.columns.len()
                && columns
                    .iter()
                    .zip(&index.columns)
                    .all(|(live, wanted)| live.eq_ignore_ascii_case(wanted));
            if unique == index.unique && same_columns {
                continue;
            }
            conn.execute_batch(&format!("DROP INDEX {}", quote_ident(&index.name)))?;
            info!(table, index = %index.name, "dropped index with a changed definition");
            report.operations.push(MigrationOperation::DropIndex {
                table: table.to_string(),
                index: index.name.clone(),
            });
        }
        let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        conn.execute_batch(&format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(table),
            columns.join(", ")
        ))?;
        debug!(table, index = %index.name, "created index");
        report.operations.push(MigrationOperation::CreateIndex {
            table: table.to_string(),
            index: index.name.clone(),
        });
    }

    reconcile_triggers(conn, schema, enable_triggers, &mut report)?;
    Ok(report)
}

/// Compares live columns with the descriptor prefix they must match.
fn check_live_columns(schema: &SchemaDescriptor, live: &[LiveColumn]) -> CoreResult<()> {
    let table = schema.table_name();
    let expected = schema.columns();

    for (position, found) in live.iter().enumerate() {
        let Some(spec) = expected.get(position) else {
            return Err(CoreError::schema_mismatch(
                table,
                &found.name,
                "column exists physically but was removed from the descriptor",
            ));
        };
        if !spec.name.eq_ignore_ascii_case(&found.name) {
            let message = if expected.iter().any(|c| c.name.eq_ignore_ascii_case(&found.name)) {
                format!("columns were reordered: expected {} at position {position}", spec.name)
            } else {
                format!("expected {} at position {position}", spec.name)
            };
            return Err(CoreError::schema_mismatch(table, &found.name, message));
        }
        if ColumnType::from_declared(&found.declared_type) != Some(spec.column_type) {
            return Err(CoreError::schema_mismatch(
                table,
                &found.name,
                format!(
                    "declared {} but found {}",
                    spec.column_type.sql_type(),
                    found.declared_type
                ),
            ));
        }
        if position == 0 && !found.primary_key {
            return Err(CoreError::schema_mismatch(
                table,
                &found.name,
                "first column is not the primary key",
            ));
        }
    }
    Ok(())
}

fn create_table_sql(schema: &SchemaDescriptor) -> String {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let mut def = format!("{} {}", quote_ident(&column.name), column.column_type.sql_type());
            if i == 0 {
                def.push_str(" PRIMARY KEY");
            }
            def
        })
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(schema.table_name()),
        columns.join(", ")
    )
}

/// Expected guard triggers for a descriptor as `(name, sql)` pairs.
pub fn guard_triggers(schema: &SchemaDescriptor) -> Vec<(String, String)> {
    let table = schema.table_name();
    let mut triggers = Vec::new();

    if !schema.inserts_allowed() {
        let name = format!("{GUARD_TRIGGER_PREFIX}{table}_insert");
        let sql = guard_sql(
            &name,
            &format!("BEFORE INSERT ON {}", quote_ident(table)),
            "",
            &format!("insert not allowed on table {table}"),
        );
        triggers.push((name, sql));
    }

    if !schema.removes_allowed() {
        let name = format!("{GUARD_TRIGGER_PREFIX}{table}_delete");
        let sql = guard_sql(
            &name,
            &format!("BEFORE DELETE ON {}", quote_ident(table)),
            "",
            &format!("delete not allowed on table {table}"),
        );
        triggers.push((name, sql));
    }

    for column in schema.columns().iter().filter(|c| !c.updatable) {
        triggers.push(column_guard(table, column));
    }

    triggers
}

fn column_guard(table: &str, column: &ColumnSpec) -> (String, String) {
    let name = format!("{GUARD_TRIGGER_PREFIX}{table}_update_{}", column.name);
    let col = quote_ident(&column.name);
    let sql = guard_sql(
        &name,
        &format!("BEFORE UPDATE OF {col} ON {}", quote_ident(table)),
        &format!(" AND NEW.{col} IS NOT OLD.{col}"),
        &format!("column {} of table {table} is not updatable", column.name),
    );
    (name, sql)
}

fn guard_sql(name: &str, event: &str, condition: &str, message: &str) -> String {
    format!(
        "CREATE TRIGGER {} {event} FOR EACH ROW WHEN {GUARD_BYPASS_FUNCTION}() = 0{condition} \
         BEGIN SELECT RAISE(ABORT, {}); END",
        quote_ident(name),
        quote_literal(message)
    )
}

fn reconcile_triggers(
    conn: &Connection,
    schema: &SchemaDescriptor,
    enable_triggers: bool,
    report: &mut MaterializeReport,
) -> CoreResult<()> {
    let table = schema.table_name();
    let expected: HashMap<String, String> = if enable_triggers {
        guard_triggers(schema).into_iter().collect()
    } else {
        HashMap::new()
    };
    let existing = live_guard_triggers(conn, table)?;

    for (name, sql) in &existing {
        let current = expected
            .get(name)
            .is_some_and(|wanted| normalize(wanted) == normalize(sql));
        if !current {
            conn.execute_batch(&format!("DROP TRIGGER {}", quote_ident(name)))?;
            debug!(table, trigger = %name, "dropped guard trigger");
            report.operations.push(MigrationOperation::DropTrigger {
                table: table.to_string(),
                trigger: name.clone(),
            });
        }
    }

    let mut names: Vec<&String> = expected.keys().collect();
    names.sort();
    for name in names {
        let sql = &expected[name];
        let current = existing
            .get(name)
            .is_some_and(|live| normalize(live) == normalize(sql));
        if !current {
            conn.execute_batch(sql)?;
            debug!(table, trigger = %name, "created guard trigger");
            report.operations.push(MigrationOperation::CreateTrigger {
                table: table.to_string(),
                trigger: name.clone(),
            });
        }
    }
    Ok(())
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reads the physical columns of a table; empty if the table is absent.
pub fn live_columns(conn: &Connection, table: &str) -> CoreResult<Vec<LiveColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(LiveColumn {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn index_names(conn: &Connection, table: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 ORDER BY name",
    )?;
    let names = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Uniqueness and key columns of a live index.
fn live_index(conn: &Connection, table: &str, index: &str) -> CoreResult<(bool, Vec<String>)> {
    let unique: bool = conn.query_row(
        "SELECT \"unique\" FROM pragma_index_list(?1) WHERE name = ?2",
        [table, index],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let columns = stmt
        .query_map([index], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok((unique, columns))
}

fn live_guard_triggers(conn: &Connection, table: &str) -> CoreResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1",
    )?;
    let triggers = stmt
        .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(triggers
        .into_iter()
        .filter(|(name, _)| name.starts_with(GUARD_TRIGGER_PREFIX))
        .collect())
}

/// Lists user tables in the database.
pub fn list_tables(conn: &Connection) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Describes one physical table.
///
/// # Errors
///
/// Returns `NotFound` if the table does not exist.
pub fn inspect_table(conn: &Connection, table: &str) -> CoreResult<TableInfo> {
    let columns = live_columns(conn, table)?;
    if columns.is_empty() {
        return Err(CoreError::not_found(table));
    }
    let mut guard_triggers: Vec<String> = live_guard_triggers(conn, table)?.into_keys().collect();
    guard_triggers.sort();
    Ok(TableInfo {
        name: table.to_string(),
        columns,
        indexes: index_names(conn, table)?,
        guard_triggers,
    })
}
