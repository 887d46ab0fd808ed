//! The per-table synchronizer contract.
//!
//! One [`TableSynchronizer`] exists per entity type. It owns the table's
//! [`SchemaDescriptor`] and receives every committed change to that table
//! through three callbacks. Callbacks must be idempotent: after a restart the
//! same row state may be delivered again.
//!
//! # Usage
//!
//! ```rust,ignore
//! struct Stops {
//!     schema: SchemaDescriptor,
//!     by_id: RwLock<HashMap<i64, Stop>>,
//! }
//!
//! impl TableSynchronizer for Stops {
//!     fn schema(&self) -> &SchemaDescriptor {
//!         &self.schema
//!     }
//!
//!     fn rows_added(&self, rows: &[Row], _first: bool) -> CallbackResult {
//!         let mut by_id = self.by_id.write();
//!         for row in rows {
//!             by_id.insert(row.get_i64("id").unwrap_or_default(), Stop::try_from(row)?);
//!         }
//!         Ok(())
//!     }
//!     // rows_updated, rows_removed ...
//! }
//! ```

use crate::error::CoreResult;
use crate::migration::{self, MaterializeReport};
use crate::schema::{quote_ident, SchemaDescriptor};
use crate::value::Row;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

/// Error a consumer callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a consumer callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Keeps one table and its in-memory representation in step.
pub trait TableSynchronizer: Send + Sync {
    /// The table definition.
    fn schema(&self) -> &SchemaDescriptor;

    /// Name of the primary key column.
    ///
    /// Must name the table's first column, which is its rowid alias.
    fn primary_key_column(&self) -> &str {
        self.schema()
            .primary_key()
            .map(|c| c.name.as_str())
            .unwrap_or("rowid")
    }

    /// If true, bootstrap sync does not call `rows_added`.
    fn ignore_callbacks_on_first_sync(&self) -> bool {
        false
    }

    /// If false, guard triggers are not installed (and removed if present).
    fn enable_triggers(&self) -> bool {
        true
    }

    /// Creates or additively migrates the physical table.
    fn materialize_schema(&self, conn: &Connection) -> CoreResult<MaterializeReport> {
        migration::materialize_schema(conn, self.schema(), self.enable_triggers())
    }

    /// Replays every existing row as a first-sync `rows_added`.
    ///
    /// Returns the number of rows read. A callback error is logged, not
    /// returned: the rows are already loaded as far as the store is concerned.
    fn bootstrap_sync(&self, conn: &Connection) -> CoreResult<usize> {
        let table = self.schema().table_name();
        let rows = fetch_all(conn, self.schema())?;
        if self.ignore_callbacks_on_first_sync() {
            debug!(table, rows = rows.len(), "bootstrap callbacks suppressed");
            return Ok(rows.len());
        }
        if let Err(err) = self.rows_added(&rows, true) {
            warn!(table, callback = "rows_added", error = %err, "bootstrap callback failed");
        }
        Ok(rows.len())
    }

    /// Rows were inserted (or exist at startup, when `is_first_sync`).
    fn rows_added(&self, rows: &[Row], is_first_sync: bool) -> CallbackResult;

    /// Rows were updated; each carries its full current state.
    fn rows_updated(&self, rows: &[Row]) -> CallbackResult;

    /// Rows were deleted; each carries only the primary key.
    fn rows_removed(&self, rows: &[Row]) -> CallbackResult;
}

fn select_sql(schema: &SchemaDescriptor) -> String {
    let columns: Vec<String> = schema.columns().iter().map(|c| quote_ident(&c.name)).collect();
    format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_ident(schema.table_name())
    )
}

/// Reads every row of a table in primary key order.
pub fn fetch_all(conn: &Connection, schema: &SchemaDescriptor) -> CoreResult<Vec<Row>> {
    let columns = schema.column_names();
    let mut stmt = conn.prepare(&format!("{} ORDER BY rowid", select_sql(schema)))?;
    let rows = stmt
        .query_map([], |r| Row::from_sql(r, &columns))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Reads one row by primary key.
pub fn fetch_row(conn: &Connection, schema: &SchemaDescriptor, row_id: i64) -> CoreResult<Option<Row>> {
    let columns = schema.column_names();
    let mut stmt = conn.prepare_cached(&format!("{} WHERE rowid = ?1", select_sql(schema)))?;
    let row = stmt
        .query_row([row_id], |r| Row::from_sql(r, &columns))
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardBypass;
    use crate::schema::ColumnType;
    use parking_lot::Mutex;

    struct Collect {
        schema: SchemaDescriptor,
        ignore_first: bool,
        added: Mutex<Vec<(Row, bool)>>,
    }

    impl TableSynchronizer for Collect {
        fn schema(&self) -> &SchemaDescriptor {
            &self.schema
        }
        fn ignore_callbacks_on_first_sync(&self) -> bool {
            self.ignore_first
        }
        fn rows_added(&self, rows: &[Row], is_first_sync: bool) -> CallbackResult {
            self.added
                .lock()
                .extend(rows.iter().map(|r| (r.clone(), is_first_sync)));
            Ok(())
        }
        fn rows_updated(&self, _rows: &[Row]) -> CallbackResult {
            Ok(())
        }
        fn rows_removed(&self, _rows: &[Row]) -> CallbackResult {
            Ok(())
        }
    }

    fn collect(ignore_first: bool) -> Collect {
        Collect {
            schema: SchemaDescriptor::new("stops")
                .column("id", ColumnType::Integer)
                .column("name", ColumnType::Text),
            ignore_first,
            added: Mutex::new(Vec::new()),
        }
    }

    fn seeded(sync: &Collect) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        GuardBypass::new().install(&conn).unwrap();
        sync.materialize_schema(&conn).unwrap();
        conn.execute_batch("INSERT INTO stops VALUES (2, 'b'); INSERT INTO stops VALUES (1, 'a');")
            .unwrap();
        conn
    }

    #[test]
    fn default_primary_key_is_first_column() {
        assert_eq!(collect(false).primary_key_column(), "id");
    }

    #[test]
    fn bootstrap_delivers_rows_in_key_order() {
        let sync = collect(false);
        let conn = seeded(&sync);

        assert_eq!(sync.bootstrap_sync(&conn).unwrap(), 2);
        let added = sync.added.lock();
        assert_eq!(added[0].0, Row::new().with("id", 1).with("name", "a"));
        assert_eq!(added[1].0.get_i64("id"), Some(2));
        assert!(added.iter().all(|(_, first)| *first));
    }

    #[test]
    fn bootstrap_can_suppress_callbacks() {
        let sync = collect(true);
        let conn = seeded(&sync);

        assert_eq!(sync.bootstrap_sync(&conn).unwrap(), 2);
        assert!(sync.added.lock().is_empty());
    }

    #[test]
    fn fetch_row_missing_is_none() {
        let sync = collect(false);
        let conn = seeded(&sync);

        assert!(fetch_row(&conn, sync.schema(), 99).unwrap().is_none());
        let row = fetch_row(&conn, sync.schema(), 2).unwrap().unwrap();
        assert_eq!(row.get_text("name"), Some("b"));
    }
}
