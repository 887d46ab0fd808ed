//! The change queue executor.
//!
//! The executor owns the single physical connection and the event queue. The
//! thread that calls [`ChangeQueueExecutor::initialize`] becomes the owning
//! thread; it runs the drain loop, either explicitly through
//! [`ChangeQueueExecutor::drain`] or [`ChangeQueueExecutor::run_until`], or
//! inside a thread started by [`ChangeQueueExecutor::spawn`].
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. the connection lock, reentrant so a synchronizer callback running
//!    inside a drain can query through the same executor;
//! 2. the queue lock, held only to push or pop a single event.
//!
//! The native hooks never see the connection. They hold an [`EventSink`],
//! which can only stage events.

use crate::change_feed::{ChangeEvent, EventQueue, EventSink, Operation};
use crate::config::ExecutorConfig;
use crate::error::{CoreError, CoreResult};
use crate::guard::GuardBypass;
use crate::registry::{BootstrapReport, Dispatch, SyncRegistry};
use crate::value::Row;
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::hooks::Action;
use rusqlite::{Connection, Params};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Whether guard triggers apply to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Guards {
    /// Guard triggers abort writes that violate a table's policy.
    #[default]
    Enforced,
    /// The bypass clause is raised for the duration of the write.
    Bypassed,
}

/// Owns the connection and turns committed changes into synchronizer
/// callbacks.
pub struct ChangeQueueExecutor {
    config: ExecutorConfig,
    registry: Arc<SyncRegistry>,
    connection: ReentrantMutex<RefCell<Option<Connection>>>,
    queue: Arc<EventQueue>,
    bypass: GuardBypass,
    owner: Mutex<Option<ThreadId>>,
    drainer: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
}

impl ChangeQueueExecutor {
    /// Creates an executor; nothing is opened until [`initialize`](Self::initialize).
    pub fn new(config: ExecutorConfig, registry: Arc<SyncRegistry>) -> Self {
        Self {
            config,
            registry,
            connection: ReentrantMutex::new(RefCell::new(None)),
            queue: Arc::new(EventQueue::new()),
            bypass: GuardBypass::new(),
            owner: Mutex::new(None),
            drainer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts an executor on a dedicated owning thread.
    ///
    /// Returns once bootstrap has finished. The thread drains until the
    /// handle is stopped or dropped, then finalizes the connection.
    ///
    /// # Errors
    ///
    /// Returns the error that made `initialize` fail on the new thread.
    pub fn spawn(config: ExecutorConfig, registry: Arc<SyncRegistry>) -> CoreResult<ExecutorHandle> {
        let executor = Arc::new(Self::new(config, registry));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("tablesync-executor".to_string())
            .spawn({
                let executor = Arc::clone(&executor);
                let stop = Arc::clone(&stop);
                move || -> CoreResult<()> {
                    match executor.initialize() {
                        Ok(report) => {
                            let _ = ready_tx.send(Ok(report));
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return Ok(());
                        }
                    }
                    let result = executor.run_until(&stop);
                    executor.finalize()?;
                    result
                }
            })
            .map_err(|e| CoreError::invalid_operation(format!("cannot start executor thread: {e}")))?;

        let bootstrap = ready_rx
            .recv()
            .map_err(|_| CoreError::invalid_operation("executor thread exited during initialize"))??;

        Ok(ExecutorHandle {
            executor,
            stop,
            thread: Some(thread),
            bootstrap,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the connection and bootstraps every registered table.
    ///
    /// The calling thread becomes the owning thread. Registration closes
    /// here; the hooks are installed after bootstrap, so rows loaded at
    /// startup are delivered only as first-sync `rows_added`.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error if any table cannot be reconciled
    /// with its descriptor, or with a storage error if the database cannot
    /// be opened. The executor is left uninitialized in both cases.
    pub fn initialize(&self) -> CoreResult<BootstrapReport> {
        let guard = self.connection.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        if guard.borrow().is_some() {
            return Err(CoreError::AlreadyInitialized);
        }

        let conn = self.open()?;
        self.bypass.install(&conn)?;
        *guard.borrow_mut() = Some(conn);
        *self.owner.lock() = Some(thread::current().id());

        let tables = self.registry.close();
        let bootstrap = {
            let cell = guard.borrow();
            let conn = cell.as_ref().ok_or(CoreError::NotInitialized)?;
            self.registry.register_callback(conn).map(|report| {
                install_hooks(conn, EventSink::new(Arc::clone(&self.queue), tables));
                report
            })
        };

        match bootstrap {
            Ok(report) => {
                info!(
                    path = ?self.config.path,
                    tables = report.tables.len(),
                    skipped = report.skipped.len(),
                    "executor initialized"
                );
                Ok(report)
            }
            Err(err) => {
                guard.borrow_mut().take();
                *self.owner.lock() = None;
                Err(err)
            }
        }
    }

    fn open(&self) -> CoreResult<Connection> {
        let conn = match &self.config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(self.config.busy_timeout)?;
        if self.config.wal {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(mode = %mode, "journal mode set");
        }
        conn.pragma_update(None, "foreign_keys", self.config.foreign_keys)?;
        Ok(conn)
    }

    /// Closes the connection.
    ///
    /// Later queries and writes fail with `Closed`; finalizing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Refuses while a drain or a query holds the connection.
    pub fn finalize(&self) -> CoreResult<()> {
        let guard = self.connection.lock();
        if self.drainer.lock().is_some() {
            return Err(CoreError::invalid_operation("cannot finalize during a drain"));
        }
        let mut cell = guard
            .try_borrow_mut()
            .map_err(|_| CoreError::invalid_operation("cannot finalize while the connection is in use"))?;
        let Some(conn) = cell.take() else {
            self.closed.store(true, Ordering::SeqCst);
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);

        let pending = self.queue.len();
        if pending > 0 {
            warn!(pending, "finalizing with undrained change events");
        }
        conn.close().map_err(|(_, e)| CoreError::from(e))?;
        info!("executor finalized");
        Ok(())
    }

    /// Returns true between a successful `initialize` and `finalize`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connection.lock().borrow().is_some()
    }

    /// Returns true on the thread that initialized the executor.
    #[must_use]
    pub fn is_owning_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// The registry this executor dispatches to.
    #[must_use]
    pub fn registry(&self) -> &Arc<SyncRegistry> {
        &self.registry
    }

    /// Executor configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Appends an event to the ready queue, bypassing the hooks.
    ///
    /// Returns the sequence assigned to it.
    pub fn enqueue_event(&self, event: ChangeEvent) -> u64 {
        self.queue.enqueue(event)
    }

    /// Returns true if events are waiting for a drain.
    #[must_use]
    pub fn has_enqueued_event(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of events waiting for a drain.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Dispatches every queued event, oldest first.
    ///
    /// Returns the number of events dispatched. Per-event failures are
    /// logged and skipped. A drain started from inside a callback returns 0
    /// immediately; the running drain picks up whatever the callback wrote.
    ///
    /// # Errors
    ///
    /// Fails only if the executor is not open.
    pub fn drain(&self) -> CoreResult<usize> {
        let guard = self.connection.lock();
        let cell = guard.borrow();
        let conn = cell.as_ref().ok_or_else(|| self.unavailable())?;

        let Some(_draining) = DrainScope::enter(&self.drainer) else {
            trace!("nested drain skipped");
            return Ok(0);
        };

        let mut dispatched = 0;
        while let Some(event) = self.queue.pop() {
            self.post_event(conn, &event);
            self.queue.complete(event.sequence);
            dispatched += 1;
        }
        if dispatched > 0 {
            debug!(dispatched, "drain pass finished");
        }
        Ok(dispatched)
    }

    fn post_event(&self, conn: &Connection, event: &ChangeEvent) {
        match self.registry.event_callback(conn, event) {
            Ok(Dispatch::Delivered | Dispatch::Ignored | Dispatch::Vanished) => {}
            Ok(Dispatch::CallbackFailed) => {
                debug!(sequence = event.sequence, table = %event.table_name, "event delivered with callback failure");
            }
            Err(err) => {
                error!(
                    sequence = event.sequence,
                    table = %event.table_name,
                    row_id = event.row_id,
                    op = event.operation.as_str(),
                    error = %err,
                    "failed to dispatch change event"
                );
            }
        }
    }

    /// Drains until `stop` is set, sleeping on the queue between passes.
    ///
    /// # Errors
    ///
    /// Fails if the executor is closed underneath the loop.
    pub fn run_until(&self, stop: &AtomicBool) -> CoreResult<()> {
        while !stop.load(Ordering::SeqCst) {
            self.drain()?;
            self.queue.wait_for_events(self.config.drain_poll_interval);
        }
        self.drain()?;
        Ok(())
    }

    // ========================================================================
    // Queries and writes
    // ========================================================================

    /// Runs `f` with the connection, under the connection lock.
    ///
    /// # Errors
    ///
    /// Fails if the executor is not open, or with whatever `f` returns.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let guard = self.connection.lock();
        let cell = guard.borrow();
        let conn = cell.as_ref().ok_or_else(|| self.unavailable())?;
        f(conn)
    }

    /// Runs a query and collects every row.
    ///
    /// # Errors
    ///
    /// Returns storage errors to the caller.
    pub fn exec_query<P: Params>(&self, sql: &str, params: P) -> CoreResult<Vec<Row>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let rows = stmt
                .query_map(params, |r| Row::from_sql(r, &columns))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Executes one write statement and returns the number of changed rows.
    ///
    /// With `asynchronous = false` the call returns only after the events
    /// the write produced have been dispatched. On the owning thread it
    /// drains inline; elsewhere it waits up to the configured
    /// `sync_timeout`.
    ///
    /// # Errors
    ///
    /// Returns storage errors (including guard trigger aborts) and
    /// `Timeout`.
    pub fn exec_update<P: Params>(&self, sql: &str, params: P, asynchronous: bool) -> CoreResult<usize> {
        self.exec_update_with_timeout(sql, params, asynchronous, self.config.sync_timeout)
    }

    /// Like [`exec_update`](Self::exec_update) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// As `exec_update`.
    pub fn exec_update_with_timeout<P: Params>(
        &self,
        sql: &str,
        params: P,
        asynchronous: bool,
        timeout: Duration,
    ) -> CoreResult<usize> {
        let changed = self.write(sql, params, Guards::Enforced)?;
        if !asynchronous {
            self.wait_for_drain(timeout)?;
        }
        Ok(changed)
    }

    /// Like [`exec_update`](Self::exec_update) with guard triggers bypassed.
    ///
    /// Used to apply writes that originate elsewhere (replication), which
    /// must land even on tables the local process may not modify.
    ///
    /// # Errors
    ///
    /// As `exec_update`.
    pub fn exec_update_bypassing_guards<P: Params>(
        &self,
        sql: &str,
        params: P,
        asynchronous: bool,
    ) -> CoreResult<usize> {
        let changed = self.write(sql, params, Guards::Bypassed)?;
        if !asynchronous {
            self.wait_for_drain(self.config.sync_timeout)?;
        }
        Ok(changed)
    }

    /// Runs `f` inside one transaction.
    ///
    /// The transaction commits if `f` succeeds and rolls back otherwise; a
    /// rolled back transaction produces no events.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, storage errors, and `Timeout`.
    pub fn exec_transaction<T>(
        &self,
        guards: Guards,
        asynchronous: bool,
        f: impl FnOnce(&Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let value = self.with_connection(|conn| {
            let _bypass = (guards == Guards::Bypassed).then(|| self.bypass.raise());
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })?;
        if !asynchronous {
            self.wait_for_drain(self.config.sync_timeout)?;
        }
        Ok(value)
    }

    fn write<P: Params>(&self, sql: &str, params: P, guards: Guards) -> CoreResult<usize> {
        self.with_connection(|conn| {
            let _bypass = (guards == Guards::Bypassed).then(|| self.bypass.raise());
            match conn.execute(sql, params) {
                Ok(changed) => Ok(changed),
                Err(err) => {
                    if conn.is_autocommit() {
                        self.queue.discard_staged();
                    }
                    Err(err.into())
                }
            }
        })
    }

    fn wait_for_drain(&self, timeout: Duration) -> CoreResult<()> {
        let target = self.queue.last_sequence();
        if self.queue.drained_through() >= target {
            return Ok(());
        }
        if *self.drainer.lock() == Some(thread::current().id()) {
            // The running drain delivers these once the callback returns.
            return Ok(());
        }
        if self.is_owning_thread() {
            self.drain()?;
            return Ok(());
        }
        if self.queue.wait_drained(target, timeout) {
            Ok(())
        } else {
            warn!(sequence = target, waited = ?timeout, "synchronous write timed out waiting for drain");
            Err(CoreError::Timeout { waited: timeout })
        }
    }

    fn unavailable(&self) -> CoreError {
        if self.closed.load(Ordering::SeqCst) {
            CoreError::Closed
        } else {
            CoreError::NotInitialized
        }
    }
}

impl std::fmt::Debug for ChangeQueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeQueueExecutor")
            .field("path", &self.config.path)
            .field("pending_events", &self.pending_events())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for ChangeQueueExecutor {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

/// Marks the current thread as the drainer until dropped.
struct DrainScope<'a> {
    drainer: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DrainScope<'a> {
    /// Returns `None` if a drain is already running on this thread.
    fn enter(drainer: &'a Mutex<Option<ThreadId>>) -> Option<Self> {
        let mut current = drainer.lock();
        if current.is_some() {
            return None;
        }
        *current = Some(thread::current().id());
        Some(Self { drainer })
    }
}

impl Drop for DrainScope<'_> {
    fn drop(&mut self) {
        *self.drainer.lock() = None;
    }
}

fn install_hooks(conn: &Connection, sink: EventSink) {
    let capture = sink.clone();
    conn.update_hook(Some(move |action: Action, _db: &str, table: &str, row_id: i64| {
        let operation = match action {
            Action::SQLITE_INSERT => Operation::Insert,
            Action::SQLITE_UPDATE => Operation::Update,
            Action::SQLITE_DELETE => Operation::Delete,
            _ => return,
        };
        capture.capture(operation, table, row_id);
    }));

    let committed = sink.clone();
    conn.commit_hook(Some(move || {
        committed.commit();
        false
    }));
    conn.rollback_hook(Some(move || sink.rollback()));
}

/// Handle to an executor running on its own thread.
pub struct ExecutorHandle {
    executor: Arc<ChangeQueueExecutor>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<CoreResult<()>>>,
    bootstrap: BootstrapReport,
}

impl ExecutorHandle {
    /// The running executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<ChangeQueueExecutor> {
        &self.executor
    }

    /// What bootstrap did on the owning thread.
    #[must_use]
    pub fn bootstrap_report(&self) -> &BootstrapReport {
        &self.bootstrap
    }

    /// Stops the drain loop, joins the owning thread and finalizes.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop, if any.
    pub fn stop(mut self) -> CoreResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CoreResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::SeqCst);
        self.executor.queue.wake();
        thread
            .join()
            .map_err(|_| CoreError::invalid_operation("executor thread panicked"))?
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "executor thread stopped with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaDescriptor};
    use crate::synchronizer::{CallbackResult, TableSynchronizer};
    use std::sync::{OnceLock, Weak};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Added(Row, bool),
        Updated(Row),
        Removed(Row),
    }

    struct Recorder {
        schema: SchemaDescriptor,
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl Recorder {
        fn stops() -> Arc<Self> {
            Self::with_schema(
                SchemaDescriptor::new("stops")
                    .column("id", ColumnType::Integer)
                    .column("name", ColumnType::Text),
                false,
            )
        }

        fn with_schema(schema: SchemaDescriptor, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                schema,
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn push(&self, call: Call) -> CallbackResult {
            self.calls.lock().push(call);
            if self.fail {
                return Err("rejected".into());
            }
            Ok(())
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl TableSynchronizer for Recorder {
        fn schema(&self) -> &SchemaDescriptor {
            &self.schema
        }
        fn rows_added(&self, rows: &[Row], first: bool) -> CallbackResult {
            rows.iter().try_for_each(|r| self.push(Call::Added(r.clone(), first)))
        }
        fn rows_updated(&self, rows: &[Row]) -> CallbackResult {
            rows.iter().try_for_each(|r| self.push(Call::Updated(r.clone())))
        }
        fn rows_removed(&self, rows: &[Row]) -> CallbackResult {
            rows.iter().try_for_each(|r| self.push(Call::Removed(r.clone())))
        }
    }

    fn open(registry: SyncRegistry) -> ChangeQueueExecutor {
        let executor = ChangeQueueExecutor::new(ExecutorConfig::new(), Arc::new(registry));
        executor.initialize().unwrap();
        executor
    }

    fn open_stops(stops: &Arc<Recorder>) -> ChangeQueueExecutor {
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", stops.clone()).unwrap();
        open(registry)
    }

    fn stop_row(id: i64, name: &str) -> Row {
        Row::new().with("id", id).with("name", name)
    }

    #[test]
    fn insert_update_delete_scenario() {
        let stops = Recorder::stops();
        let executor = open_stops(&stops);

        executor
            .exec_update("INSERT INTO stops (id, name) VALUES (1, 'Central')", [], false)
            .unwrap();
        assert_eq!(stops.calls(), vec![Call::Added(stop_row(1, "Central"), false)]);

        executor
            .exec_update("UPDATE stops SET name = 'Central Station' WHERE id = 1", [], false)
            .unwrap();
        executor.exec_update("DELETE FROM stops WHERE id = 1", [], false).unwrap();

        assert_eq!(
            stops.calls(),
            vec![
                Call::Added(stop_row(1, "Central"), false),
                Call::Updated(stop_row(1, "Central Station")),
                Call::Removed(Row::new().with("id", 1)),
            ]
        );
        assert!(!executor.has_enqueued_event());
    }

    #[test]
    fn batched_drain_keeps_row_order() {
        let stops = Recorder::stops();
        let executor = open_stops(&stops);

        executor.exec_update("INSERT INTO stops VALUES (1, 'a')", [], true).unwrap();
        executor.exec_update("UPDATE stops SET name = 'b' WHERE id = 1", [], true).unwrap();
        executor.exec_update("DELETE FROM stops WHERE id = 1", [], true).unwrap();
        assert_eq!(executor.pending_events(), 3);

        assert_eq!(executor.drain().unwrap(), 3);
        let calls = stops.calls();
        assert!(matches!(calls[0], Call::Added(_, false)));
        assert!(matches!(calls[1], Call::Updated(_)));
        assert!(matches!(calls[2], Call::Removed(_)));
    }

    #[test]
    fn bootstrap_delivers_existing_rows_as_first_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE stops (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO stops VALUES (1, 'Central');",
            )
            .unwrap();
        }

        let stops = Recorder::stops();
        let registry = Arc::new(SyncRegistry::new());
        registry.add_table_synchronizer("10", stops.clone()).unwrap();
        let executor = ChangeQueueExecutor::new(ExecutorConfig::at(&path).wal(true), registry);
        let report = executor.initialize().unwrap();

        assert_eq!(report.tables[0].rows, 1);
        assert_eq!(stops.calls(), vec![Call::Added(stop_row(1, "Central"), true)]);
        assert!(!executor.has_enqueued_event());
    }

    #[test]
    fn callback_failure_does_not_stop_drain() {
        let broken = Recorder::with_schema(
            SchemaDescriptor::new("lines").column("id", ColumnType::Integer),
            true,
        );
        let stops = Recorder::stops();
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", broken.clone()).unwrap();
        registry.add_table_synchronizer("20", stops.clone()).unwrap();
        let executor = open(registry);

        executor.exec_update("INSERT INTO lines VALUES (1)", [], true).unwrap();
        executor.exec_update("INSERT INTO stops VALUES (2, 'b')", [], true).unwrap();
        assert_eq!(executor.drain().unwrap(), 2);

        assert_eq!(broken.calls().len(), 1);
        assert_eq!(stops.calls(), vec![Call::Added(stop_row(2, "b"), false)]);
    }

    #[test]
    fn rolled_back_transaction_produces_no_events() {
        let stops = Recorder::stops();
        let executor = open_stops(&stops);

        let result: CoreResult<()> = executor.exec_transaction(Guards::Enforced, false, |conn| {
            conn.execute("INSERT INTO stops VALUES (1, 'a')", [])?;
            Err(CoreError::invalid_operation("abandon"))
        });
        assert!(result.is_err());
        assert!(!executor.has_enqueued_event());
        assert!(stops.calls().is_empty());
        assert!(executor.exec_query("SELECT * FROM stops", []).unwrap().is_empty());
    }

    #[test]
    fn committed_transaction_delivers_every_row() {
        let stops = Recorder::stops();
        let executor = open_stops(&stops);

        executor
            .exec_transaction(Guards::Enforced, false, |conn| {
                conn.execute("INSERT INTO stops VALUES (1, 'a')", [])?;
                conn.execute("INSERT INTO stops VALUES (2, 'b')", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(stops.calls().len(), 2);
    }

    #[test]
    fn unregistered_tables_produce_no_events() {
        let executor = open_stops(&Recorder::stops());
        executor
            .exec_update("CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT)", [], false)
            .unwrap();
        executor
            .exec_update("INSERT INTO settings VALUES ('mode', 'full')", [], true)
            .unwrap();
        assert!(!executor.has_enqueued_event());
    }

    #[test]
    fn guarded_insert_needs_bypass() {
        let fares = Recorder::with_schema(
            SchemaDescriptor::new("fares")
                .column("id", ColumnType::Integer)
                .column("price", ColumnType::Integer)
                .allow_insert(false),
            false,
        );
        let registry = SyncRegistry::new();
        registry.add_table_synchronizer("10", fares.clone()).unwrap();
        let executor = open(registry);

        let denied = executor.exec_update("INSERT INTO fares VALUES (1, 100)", [], false);
        assert!(matches!(denied, Err(CoreError::Storage(_))));

        executor
            .exec_update_bypassing_guards("INSERT INTO fares VALUES (1, 100)", [], false)
            .unwrap();
        assert_eq!(fares.calls().len(), 1);
    }

    #[test]
    fn registration_closes_at_initialize() {
        let executor = open_stops(&Recorder::stops());
        let lines = Recorder::with_schema(
            SchemaDescriptor::new("lines").column("id", ColumnType::Integer),
            false,
        );
        let late = executor.registry().add_table_synchronizer("20", lines);
        assert!(matches!(late, Err(CoreError::RegistrationClosed { .. })));
    }

    #[test]
    fn lifecycle_errors() {
        let executor = ChangeQueueExecutor::new(ExecutorConfig::new(), Arc::new(SyncRegistry::new()));
        assert!(matches!(executor.exec_query("SELECT 1", []), Err(CoreError::NotInitialized)));

        executor.initialize().unwrap();
        assert!(matches!(executor.initialize(), Err(CoreError::AlreadyInitialized)));
        assert!(executor.is_owning_thread());

        executor.finalize().unwrap();
        executor.finalize().unwrap();
        assert!(!executor.is_open());
        assert!(matches!(executor.exec_query("SELECT 1", []), Err(CoreError::Closed)));
        assert!(matches!(executor.drain(), Err(CoreError::Closed)));
    }

    #[test]
    fn foreign_thread_sync_write_times_out_without_drain() {
        let stops = Recorder::stops();
        let executor = Arc::new(open_stops(&stops));

        let writer = Arc::clone(&executor);
        let result = thread::spawn(move || {
            writer.exec_update_with_timeout(
                "INSERT INTO stops VALUES (1, 'a')",
                [],
                false,
                Duration::from_millis(50),
            )
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(CoreError::Timeout { .. })));
        assert_eq!(executor.drain().unwrap(), 1);
        assert_eq!(stops.calls().len(), 1);
    }

    #[test]
    fn spawned_executor_serves_foreign_sync_writes() {
        let stops = Recorder::stops();
        let registry = Arc::new(SyncRegistry::new());
        registry.add_table_synchronizer("10", stops.clone()).unwrap();

        let handle = ChangeQueueExecutor::spawn(
            ExecutorConfig::new().drain_poll_interval(Duration::from_millis(5)),
            registry,
        )
        .unwrap();
        let executor = Arc::clone(handle.executor());
        assert!(!executor.is_owning_thread());

        executor
            .exec_update("INSERT INTO stops VALUES (1, 'Central')", [], false)
            .unwrap();
        assert_eq!(stops.calls(), vec![Call::Added(stop_row(1, "Central"), false)]);

        handle.stop().unwrap();
        assert!(matches!(executor.exec_query("SELECT 1", []), Err(CoreError::Closed)));
    }

    /// Writes an audit row for every stop it sees, through the executor.
    struct Auditor {
        schema: SchemaDescriptor,
        executor: OnceLock<Weak<ChangeQueueExecutor>>,
    }

    impl TableSynchronizer for Auditor {
        fn schema(&self) -> &SchemaDescriptor {
            &self.schema
        }
        fn rows_added(&self, rows: &[Row], first: bool) -> CallbackResult {
            if first {
                return Ok(());
            }
            let executor = self.executor.get().and_then(Weak::upgrade).ok_or("no executor")?;
            for row in rows {
                let id = row.get_i64("id").unwrap_or_default();
                let seen = executor.exec_query("SELECT name FROM stops WHERE id = ?1", [id])?;
                assert_eq!(seen.len(), 1);
                executor.exec_update("INSERT INTO audit (stop) VALUES (?1)", [id], false)?;
            }
            Ok(())
        }
        fn rows_updated(&self, _rows: &[Row]) -> CallbackResult {
            Ok(())
        }
        fn rows_removed(&self, _rows: &[Row]) -> CallbackResult {
            Ok(())
        }
    }

    #[test]
    fn callbacks_can_query_and_write_reentrantly() {
        let auditor = Arc::new(Auditor {
            schema: SchemaDescriptor::new("stops")
                .column("id", ColumnType::Integer)
                .column("name", ColumnType::Text),
            executor: OnceLock::new(),
        });
        let audit = Recorder::with_schema(
            SchemaDescriptor::new("audit")
                .column("id", ColumnType::Integer)
                .column("stop", ColumnType::Integer),
            false,
        );
        let registry = Arc::new(SyncRegistry::new());
        registry.add_table_synchronizer("10", auditor.clone()).unwrap();
        registry.add_table_synchronizer("20", audit.clone()).unwrap();
        let executor = Arc::new(ChangeQueueExecutor::new(ExecutorConfig::new(), registry));
        executor.initialize().unwrap();
        let _ = auditor.executor.set(Arc::downgrade(&executor));

        executor.exec_update("INSERT INTO stops VALUES (7, 'x')", [], false).unwrap();

        let calls = audit.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Added(row, false) if row.get_i64("stop") == Some(7)));
        assert!(!executor.has_enqueued_event());
    }
}
