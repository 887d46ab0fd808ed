//! Stress tests for the change queue executor.
//!
//! Many threads write through one executor running on its own thread;
//! every write is synchronous, so each returns only after its events were
//! dispatched.

use crate::fixtures::{registry_with, stops_schema};
use crate::recorder::RecordingSynchronizer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tablesync_core::{rusqlite::params, ChangeQueueExecutor, ExecutorConfig, TableSynchronizer};
use tempfile::TempDir;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }

    /// Operations per second.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of writing threads.
    pub writers: usize,
    /// Inserts per writer.
    pub writes_per_writer: usize,
    /// How long a synchronous write may wait for its drain.
    pub sync_timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            writers: 4,
            writes_per_writer: 100,
            sync_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs concurrent synchronous inserts into `stops` from foreign threads.
///
/// Returns the result and the synchronizer that saw the inserts.
pub fn stress_concurrent_writers(config: &StressConfig) -> (StressTestResult, Arc<RecordingSynchronizer>) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
    let registry = registry_with(vec![stops.clone() as Arc<dyn TableSynchronizer>]);
    let executor_config = ExecutorConfig::at(temp_dir.path().join("stress.db"))
        .wal(true)
        .sync_timeout(config.sync_timeout);
    let handle = ChangeQueueExecutor::spawn(executor_config, registry).expect("Failed to spawn executor");

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let writers: Vec<_> = (0..config.writers)
        .map(|writer| {
            let executor = Arc::clone(handle.executor());
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let writes = config.writes_per_writer;
            thread::spawn(move || {
                for i in 0..writes {
                    let id = i64::try_from(writer * writes + i + 1).unwrap_or(i64::MAX);
                    let result = executor.exec_update(
                        "INSERT INTO stops (id, name) VALUES (?1, ?2)",
                        params![id, format!("stop {writer}-{i}")],
                        false,
                    );
                    match result {
                        Ok(_) => successful.fetch_add(1, Ordering::SeqCst),
                        Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                    };
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("Writer thread panicked");
    }
    let duration = start.elapsed();
    handle.stop().expect("Failed to stop executor");

    let result = StressTestResult::new(
        successful.load(Ordering::SeqCst),
        failed.load(Ordering::SeqCst),
        duration,
    );
    (result, stops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_writers_all_delivered() {
        let config = StressConfig {
            writers: 3,
            writes_per_writer: 25,
            ..StressConfig::default()
        };
        let (result, stops) = stress_concurrent_writers(&config);

        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 75);
        assert_eq!(stops.mirror().len(), 75);
        assert!(stops
            .calls()
            .iter()
            .all(|call| matches!(call, crate::Callback::Added { first_sync: false, .. })));
    }
}
