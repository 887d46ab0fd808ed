//! Bootstrap ordering and startup behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tablesync_core::{
    CallbackResult, ChangeQueueExecutor, ExecutorConfig, Row, SchemaDescriptor, SyncRegistry,
    TableSynchronizer,
};
use tablesync_testkit::prelude::*;

/// Resolves each route's stop through the stops mirror.
struct Routes {
    schema: SchemaDescriptor,
    stops: Arc<RecordingSynchronizer>,
    resolved: Mutex<Vec<(i64, String)>>,
    dangling: AtomicUsize,
}

impl Routes {
    fn new(stops: Arc<RecordingSynchronizer>) -> Self {
        Self {
            schema: routes_schema(),
            stops,
            resolved: Mutex::new(Vec::new()),
            dangling: AtomicUsize::new(0),
        }
    }
}

impl TableSynchronizer for Routes {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn rows_added(&self, rows: &[Row], _is_first_sync: bool) -> CallbackResult {
        for row in rows {
            let route = row.get_i64("id").ok_or("route without id")?;
            let stop_id = row.get_i64("stop_id").ok_or("route without stop")?;
            let Some(stop) = self.stops.mirrored(stop_id) else {
                self.dangling.fetch_add(1, Ordering::SeqCst);
                return Err(format!("route {route} references unknown stop {stop_id}").into());
            };
            let name = stop.get_text("name").unwrap_or_default().to_string();
            self.resolved.lock().unwrap().push((route, name));
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

fn seed(path: &std::path::Path) {
    let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
    let routes = Arc::new(RecordingSynchronizer::new(routes_schema()));
    let registry = registry_with(vec![
        stops as Arc<dyn TableSynchronizer>,
        routes as Arc<dyn TableSynchronizer>,
    ]);
    let store = TestStore::at(path, registry);
    for (id, name) in [(1, "Central"), (2, "Harbour"), (3, "Airport")] {
        store
            .exec_update(
                "INSERT INTO stops (id, name) VALUES (?1, ?2)",
                tablesync_core::rusqlite::params![id, name],
                false,
            )
            .unwrap();
    }
    for (id, stop) in [(10, 3), (11, 1), (12, 2), (13, 1)] {
        store
            .exec_update(
                "INSERT INTO routes (id, name, stop_id) VALUES (?1, 'line', ?2)",
                [id, stop],
                false,
            )
            .unwrap();
    }
    store.close();
}

#[test]
fn bootstrap_follows_rank_not_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transit.db");
    seed(&path);

    let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
    let routes = Arc::new(Routes::new(stops.clone()));
    let registry = Arc::new(SyncRegistry::new());
    registry.add_table_synchronizer("20", routes.clone()).unwrap();
    registry.add_table_synchronizer("10", stops.clone()).unwrap();

    let executor = ChangeQueueExecutor::new(ExecutorConfig::at(&path), registry);
    let report = executor.initialize().unwrap();

    let order: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(order, vec!["stops", "routes"]);
    assert!(report.skipped.is_empty());
    assert_eq!(routes.dangling.load(Ordering::SeqCst), 0);

    let resolved = routes.resolved.lock().unwrap().clone();
    assert_eq!(
        resolved,
        vec![
            (10, "Airport".to_string()),
            (11, "Central".to_string()),
            (12, "Harbour".to_string()),
            (13, "Central".to_string()),
        ]
    );
    assert!(matches!(
        stops.calls().as_slice(),
        [Callback::Added { first_sync: true, rows }] if rows.len() == 3
    ));
}

#[test]
fn bootstrap_then_live_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transit.db");
    seed(&path);

    let stops = Arc::new(RecordingSynchronizer::new(stops_schema()).ignoring_first_sync());
    let store = TestStore::at(&path, registry_with(vec![stops.clone() as Arc<dyn TableSynchronizer>]));
    assert!(stops.calls().is_empty());

    store
        .exec_update("UPDATE stops SET name = 'Central Station' WHERE id = 1", [], false)
        .unwrap();
    assert_eq!(stops.deliveries(), vec![("updated", 1)]);
}

#[test]
fn additive_migration_keeps_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transit.db");
    seed(&path);

    let wider = stops_schema().column("zone", tablesync_core::ColumnType::Integer);
    let stops = Arc::new(RecordingSynchronizer::new(wider));
    let registry = Arc::new(SyncRegistry::new());
    registry.add_table_synchronizer("10", stops.clone()).unwrap();
    let executor = ChangeQueueExecutor::new(ExecutorConfig::at(&path), registry);
    let report = executor.initialize().unwrap();

    assert_eq!(report.tables[0].migration.added_columns(), vec!["zone"]);
    assert_eq!(stops.mirror().len(), 3);
    assert_eq!(stops.mirrored(2).unwrap().get_text("name"), Some("Harbour"));
    assert_eq!(stops.mirrored(2).unwrap().get("zone"), Some(&tablesync_core::Value::Null));
}
