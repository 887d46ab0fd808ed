//! Registry of table synchronizers and event dispatch.
//!
//! Synchronizers live in an arena indexed by [`TableId`]. Table names and
//! ranks map onto that index; the hot path carries the id resolved at capture
//! time, so dispatch never walks the name map for known tables.
//!
//! The registry is open for registration until the executor initializes, and
//! read-only afterwards.

use crate::change_feed::{ChangeEvent, Operation};
use crate::error::{CoreError, CoreResult};
use crate::migration::MaterializeReport;
use crate::synchronizer::{fetch_row, CallbackResult, TableSynchronizer};
use crate::value::Row;
use parking_lot::RwLock;
use rusqlite::Connection;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Index of a synchronizer in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    /// Creates an id from an arena index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The arena index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The callback ran and succeeded.
    Delivered,
    /// No synchronizer is registered for the table.
    Ignored,
    /// The row no longer exists; a later delete event covers it.
    Vanished,
    /// The callback failed; the in-memory state for that row is stale.
    CallbackFailed,
}

/// Per-table outcome of bootstrap.
#[derive(Debug, Clone)]
pub struct TableBootstrap {
    /// Table name.
    pub table: String,
    /// DDL executed while materializing.
    pub migration: MaterializeReport,
    /// Rows read during bootstrap.
    pub rows: usize,
}

/// Outcome of the bootstrap pass.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// Tables bootstrapped, in rank order.
    pub tables: Vec<TableBootstrap>,
    /// Tables skipped because of a non-fatal failure, with the reason.
    pub skipped: Vec<(String, String)>,
}

struct Entry {
    rank: String,
    synchronizer: Arc<dyn TableSynchronizer>,
}

#[derive(Default)]
struct Tables {
    entries: Vec<Entry>,
    by_name: HashMap<String, TableId>,
    by_rank: BTreeMap<String, TableId>,
}

/// Holds every registered synchronizer and routes change events to them.
#[derive(Default)]
pub struct SyncRegistry {
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl SyncRegistry {
    /// Creates an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronizer under a rank.
    ///
    /// Ranks are compared as strings; bootstrap visits tables in ascending
    /// rank, so a table must rank after every table it references.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationClosed` after the executor initialized,
    /// `DuplicateRegistration` for a repeated table name or rank, and
    /// `InvalidSchema` for a malformed descriptor.
    pub fn add_table_synchronizer(
        &self,
        rank: impl Into<String>,
        synchronizer: Arc<dyn TableSynchronizer>,
    ) -> CoreResult<TableId> {
        let rank = rank.into();
        let schema = synchronizer.schema();
        let table = schema.table_name().to_string();

        let mut tables = self.tables.write();
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::RegistrationClosed { table });
        }

        schema.validate()?;
        let pk = synchronizer.primary_key_column();
        if schema.primary_key().map(|c| c.name.as_str()) != Some(pk) {
            return Err(CoreError::invalid_schema(
                &table,
                format!("primary key column {pk} must be the first column"),
            ));
        }

        if tables.by_name.contains_key(&table) {
            return Err(CoreError::DuplicateRegistration {
                message: format!("table {table} is already registered"),
            });
        }
        if let Some(other) = tables.by_rank.get(&rank) {
            let other = tables.entries[other.index()].synchronizer.schema().table_name();
            return Err(CoreError::DuplicateRegistration {
                message: format!("rank {rank} is used by {other} and {table}"),
            });
        }

        let index = u32::try_from(tables.entries.len())
            .map_err(|_| CoreError::invalid_operation("too many synchronizers"))?;
        let id = TableId::new(index);
        tables.entries.push(Entry {
            rank: rank.clone(),
            synchronizer,
        });
        tables.by_name.insert(table.clone(), id);
        tables.by_rank.insert(rank.clone(), id);
        debug!(table = %table, rank = %rank, "registered synchronizer");
        Ok(id)
    }

    /// Closes registration and returns the frozen name map for the hooks.
    pub fn close(&self) -> Arc<HashMap<String, TableId>> {
        let tables = self.tables.read();
        self.closed.store(true, Ordering::SeqCst);
        Arc::new(tables.by_name.clone())
    }

    /// Returns true once registration is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered synchronizers.
    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tables.read().entries.is_empty()
    }

    /// Looks up a synchronizer by table name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no synchronizer is registered for `name`.
    pub fn get_table_synchronizer(&self, name: &str) -> CoreResult<Arc<dyn TableSynchronizer>> {
        let tables = self.tables.read();
        tables
            .by_name
            .get(name)
            .map(|id| Arc::clone(&tables.entries[id.index()].synchronizer))
            .ok_or_else(|| CoreError::not_found(name))
    }

    /// Looks up a synchronizer by id.
    pub fn synchronizer(&self, id: TableId) -> Option<Arc<dyn TableSynchronizer>> {
        self.tables
            .read()
            .entries
            .get(id.index())
            .map(|e| Arc::clone(&e.synchronizer))
    }

    /// Resolves a table name to its id.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables.read().by_name.get(name).copied()
    }

    /// `(rank, table name)` pairs in bootstrap order.
    pub fn tables_in_rank_order(&self) -> Vec<(String, String)> {
        let tables = self.tables.read();
        tables
            .by_rank
            .values()
            .map(|id| {
                let entry = &tables.entries[id.index()];
                (
                    entry.rank.clone(),
                    entry.synchronizer.schema().table_name().to_string(),
                )
            })
            .collect()
    }

    fn ranked(&self) -> Vec<Arc<dyn TableSynchronizer>> {
        let tables = self.tables.read();
        tables
            .by_rank
            .values()
            .map(|id| Arc::clone(&tables.entries[id.index()].synchronizer))
            .collect()
    }

    /// Materializes and bootstraps every table in rank order.
    ///
    /// # Errors
    ///
    /// Configuration errors abort the pass. Any other failure is logged and
    /// the table skipped; bootstrap continues with the next rank.
    pub fn register_callback(&self, conn: &Connection) -> CoreResult<BootstrapReport> {
        let mut report = BootstrapReport::default();

        for synchronizer in self.ranked() {
            let table = synchronizer.schema().table_name().to_string();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let migration = synchronizer.materialize_schema(conn)?;
                let rows = synchronizer.bootstrap_sync(conn)?;
                Ok::<_, CoreError>((migration, rows))
            }));

            match outcome {
                Ok(Ok((migration, rows))) => {
                    info!(table = %table, rows, ddl = migration.operations.len(), "table bootstrapped");
                    report.tables.push(TableBootstrap {
                        table,
                        migration,
                        rows,
                    });
                }
                Ok(Err(err)) if err.is_configuration() => {
                    error!(table = %table, error = %err, "fatal configuration error during bootstrap");
                    return Err(err);
                }
                Ok(Err(err)) => {
                    error!(table = %table, error = %err, "bootstrap failed; table skipped");
                    report.skipped.push((table, err.to_string()));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(table = %table, panic = %message, "bootstrap panicked; table skipped");
                    report.skipped.push((table, message));
                }
            }
        }

        Ok(report)
    }

    /// Routes one drained event to its synchronizer.
    ///
    /// Inserts and updates re-query the current row; deletes carry a
    /// synthetic row holding only the primary key.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the re-query fails. Callback failures are
    /// logged and reported as [`Dispatch::CallbackFailed`].
    pub fn event_callback(&self, conn: &Connection, event: &ChangeEvent) -> CoreResult<Dispatch> {
        let synchronizer = match event.table {
            Some(id) => self.synchronizer(id),
            None => self.get_table_synchronizer(&event.table_name).ok(),
        };
        let Some(synchronizer) = synchronizer else {
            return Ok(Dispatch::Ignored);
        };

        let table = event.table_name.as_str();
        let row_id = event.row_id;
        let delivered = match event.operation {
            Operation::Insert | Operation::Update => {
                let Some(row) = fetch_row(conn, synchronizer.schema(), row_id)? else {
                    debug!(table, row_id, op = event.operation.as_str(), "row vanished before drain");
                    return Ok(Dispatch::Vanished);
                };
                let rows = [row];
                if event.operation == Operation::Insert {
                    invoke(table, row_id, "rows_added", || synchronizer.rows_added(&rows, false))
                } else {
                    invoke(table, row_id, "rows_updated", || synchronizer.rows_updated(&rows))
                }
            }
            Operation::Delete => {
                let rows = [Row::new().with(synchronizer.primary_key_column(), row_id)];
                invoke(table, row_id, "rows_removed", || synchronizer.rows_removed(&rows))
            }
        };

        Ok(if delivered {
            Dispatch::Delivered
        } else {
            Dispatch::CallbackFailed
        })
    }
}

/// Runs a callback, converting errors and panics into a warning.
fn invoke(table: &str, row_id: i64, callback: &'static str, f: impl FnOnce() -> CallbackResult) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(table, row_id, callback, error = %err, "synchronizer callback failed; in-memory state is stale");
            false
        }
        Err(payload) => {
            warn!(
                table,
                row_id,
                callback,
                panic = %panic_message(payload.as_ref()),
                "synchronizer callback panicked; in-memory state is stale"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardBypass;
    use crate::schema::{ColumnType, SchemaDescriptor};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    struct Recorder {
        schema: SchemaDescriptor,
        log: Arc<Log>,
        fail_updates: bool,
    }

    impl Recorder {
        fn new(table: &str, log: &Arc<Log>) -> Arc<Self> {
            Arc::new(Self {
                schema: SchemaDescriptor::new(table)
                    .column("id", ColumnType::Integer)
                    .column("name", ColumnType::Text),
                log: Arc::clone(log),
                fail_updates: false,
            })
        }

        fn record(&self, what: &str, rows: &[Row]) {
            for row in rows {
                self.log.0.lock().push(format!(
                    "{}:{}:{}",
                    self.schema.table_name(),
                    what,
                    row.get_i64("id").unwrap_or_default()
                ));
            }
        }
    }

    impl TableSynchronizer for Recorder {
        fn schema(&self) -> &SchemaDescriptor {
            &self.schema
        }
        fn rows_added(&self, rows: &[Row], first: bool) -> CallbackResult {
            self.record(if first { "boot" } else { "add" }, rows);
            Ok(())
        }
        fn rows_updated(&self, rows: &[Row]) -> CallbackResult {
            if self.fail_updates {
                return Err("broken".into());
            }
            self.record("update", rows);
            Ok(())
        }
        fn rows_removed(&self, rows: &[Row]) -> CallbackResult {
            self.record("remove", rows);
            Ok(())
        }
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        GuardBypass::new().install(&conn).unwrap();
        conn
    }

    #[test]
    fn duplicate_name_and_rank_rejected() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();

        let dup_name = registry.add_table_synchronizer("20", Recorder::new("stops", &log));
        assert!(matches!(dup_name, Err(CoreError::DuplicateRegistration { .. })));

        let dup_rank = registry.add_table_synchronizer("10", Recorder::new("lines", &log));
        assert!(matches!(dup_rank, Err(CoreError::DuplicateRegistration { .. })));
    }

    #[test]
    fn registration_after_close_is_rejected() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        registry.close();

        let err = registry
            .add_table_synchronizer("10", Recorder::new("stops", &log))
            .unwrap_err();
        assert!(matches!(err, CoreError::RegistrationClosed { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn lookup_by_name() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        let id = registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();

        assert_eq!(registry.table_id("stops"), Some(id));
        assert!(registry.get_table_synchronizer("stops").is_ok());
        assert!(matches!(
            registry.get_table_synchronizer("fares"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn bootstrap_follows_rank_not_registration_order() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("20", Recorder::new("lines", &log)).unwrap();
        registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();

        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE stops (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE lines (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO stops VALUES (1, 's');
             INSERT INTO lines VALUES (7, 'l');",
        )
        .unwrap();

        let report = registry.register_callback(&conn).unwrap();
        assert_eq!(report.tables.len(), 2);
        assert_eq!(report.tables[0].table, "stops");
        assert_eq!(*log.0.lock(), vec!["stops:boot:1", "lines:boot:7"]);
        assert_eq!(
            registry.tables_in_rank_order(),
            vec![("10".into(), "stops".into()), ("20".into(), "lines".into())]
        );
    }

    #[test]
    fn schema_mismatch_aborts_bootstrap() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();

        let conn = conn();
        conn.execute_batch("CREATE TABLE stops (id INTEGER PRIMARY KEY, name BLOB)")
            .unwrap();
        let err = registry.register_callback(&conn).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn dispatch_routes_by_operation() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        let id = registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();
        let conn = conn();
        registry.register_callback(&conn).unwrap();
        conn.execute("INSERT INTO stops VALUES (1, 'a')", []).unwrap();

        let mut insert = ChangeEvent::insert("stops", 1);
        insert.table = Some(id);
        assert_eq!(registry.event_callback(&conn, &insert).unwrap(), Dispatch::Delivered);
        assert_eq!(
            registry.event_callback(&conn, &ChangeEvent::update("stops", 1)).unwrap(),
            Dispatch::Delivered
        );
        assert_eq!(
            registry.event_callback(&conn, &ChangeEvent::delete("stops", 1)).unwrap(),
            Dispatch::Delivered
        );
        assert_eq!(
            *log.0.lock(),
            vec!["stops:add:1", "stops:update:1", "stops:remove:1"]
        );
    }

    #[test]
    fn unknown_table_and_vanished_row() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", Recorder::new("stops", &log)).unwrap();
        let conn = conn();
        registry.register_callback(&conn).unwrap();

        assert_eq!(
            registry.event_callback(&conn, &ChangeEvent::insert("config", 1)).unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(
            registry.event_callback(&conn, &ChangeEvent::insert("stops", 42)).unwrap(),
            Dispatch::Vanished
        );
        assert!(log.0.lock().is_empty());
    }

    #[test]
    fn callback_failure_is_reported_not_raised() {
        let log = Arc::new(Log::default());
        let registry = SyncRegistry::new();
        let failing = Arc::new(Recorder {
            schema: SchemaDescriptor::new("stops")
                .column("id", ColumnType::Integer)
                .column("name", ColumnType::Text),
            log: Arc::clone(&log),
            fail_updates: true,
        });
        registry.add_table_synchronizer("10", failing).unwrap();
        let conn = conn();
        registry.register_callback(&conn).unwrap();
        conn.execute("INSERT INTO stops VALUES (1, 'a')", []).unwrap();

        assert_eq!(
            registry.event_callback(&conn, &ChangeEvent::update("stops", 1)).unwrap(),
            Dispatch::CallbackFailed
        );
    }
}
