//! Test fixtures and store helpers.
//!
//! Provides sample table descriptors and executors over temporary
//! databases.

use serde_json::{json, Map, Value as Json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablesync_core::{
    fetch_all, ChangeQueueExecutor, ColumnType, ExecutorConfig, SchemaDescriptor, SyncRegistry, Value,
};
use tempfile::TempDir;

/// Transit stops: `id`, `name`, `lat`, `lon`, read-only `code`.
pub fn stops_schema() -> SchemaDescriptor {
    SchemaDescriptor::new("stops")
        .column("id", ColumnType::Integer)
        .column("name", ColumnType::Text)
        .column("lat", ColumnType::Real)
        .column("lon", ColumnType::Real)
        .read_only_column("code", ColumnType::Text)
        .index("stops_name", &["name"])
}

/// Routes, each serving one stop by `stop_id`.
pub fn routes_schema() -> SchemaDescriptor {
    SchemaDescriptor::new("routes")
        .column("id", ColumnType::Integer)
        .column("name", ColumnType::Text)
        .column("stop_id", ColumnType::Integer)
        .index("routes_stop", &["stop_id"])
}

/// An executor over a temporary database, removed on drop.
pub struct TestStore {
    /// The executor, initialized.
    pub executor: Arc<ChangeQueueExecutor>,
    path: Option<PathBuf>,
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Initializes an executor over an in-memory database.
    pub fn memory(registry: Arc<SyncRegistry>) -> Self {
        Self::open(ExecutorConfig::new(), registry, None)
    }

    /// Initializes an executor over a database file in a fresh directory.
    pub fn file(registry: Arc<SyncRegistry>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("store.db");
        let mut store = Self::open(ExecutorConfig::at(&path), registry, Some(path));
        store._temp_dir = Some(temp_dir);
        store
    }

    /// Initializes an executor over an existing database file.
    ///
    /// The caller keeps the directory alive.
    pub fn at(path: impl AsRef<Path>, registry: Arc<SyncRegistry>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self::open(ExecutorConfig::at(&path), registry, Some(path))
    }

    fn open(config: ExecutorConfig, registry: Arc<SyncRegistry>, path: Option<PathBuf>) -> Self {
        let executor = Arc::new(ChangeQueueExecutor::new(config, registry));
        executor.initialize().expect("Failed to initialize executor");
        Self {
            executor,
            path,
            _temp_dir: None,
        }
    }

    /// The database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Finalizes the executor and hands back the directory, so the file
    /// can be reopened.
    pub fn close(mut self) -> Option<TempDir> {
        self.executor.finalize().expect("Failed to finalize executor");
        self._temp_dir.take()
    }
}

impl std::ops::Deref for TestStore {
    type Target = ChangeQueueExecutor;

    fn deref(&self) -> &Self::Target {
        &self.executor
    }
}

/// Creates a registry holding the given synchronizers, ranked in order.
pub fn registry_with(synchronizers: Vec<Arc<dyn tablesync_core::TableSynchronizer>>) -> Arc<SyncRegistry> {
    let registry = Arc::new(SyncRegistry::new());
    for (rank, synchronizer) in synchronizers.into_iter().enumerate() {
        registry
            .add_table_synchronizer(format!("{rank:04}"), synchronizer)
            .expect("Failed to register synchronizer");
    }
    registry
}

/// Runs a test with an in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use tablesync_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(registry, |store| {
///         store.exec_update("INSERT INTO stops (id) VALUES (1)", [], false).unwrap();
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(registry: Arc<SyncRegistry>, f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::memory(registry);
    f(&store)
}

/// Every row of a table as JSON, keyed by primary key.
///
/// Two stores whose snapshots are equal hold the same data.
pub fn table_snapshot(executor: &ChangeQueueExecutor, schema: &SchemaDescriptor) -> Json {
    let rows = executor
        .with_connection(|conn| fetch_all(conn, schema))
        .expect("Failed to read table");
    let key = schema.primary_key().map(|c| c.name.clone()).unwrap_or_default();
    let mut snapshot = Map::new();
    for row in rows {
        let id = row.get_i64(&key).unwrap_or_default();
        let mut fields = Map::new();
        for (column, value) in row.iter() {
            fields.insert(column.to_string(), to_json(value));
        }
        snapshot.insert(id.to_string(), Json::Object(fields));
    }
    Json::Object(snapshot)
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Integer(i) => json!(i),
        Value::Real(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(b),
    }
}
