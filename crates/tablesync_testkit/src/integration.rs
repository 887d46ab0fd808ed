//! Cross-crate integration test helpers.
//!
//! [`MirrorHarness`] drives mutations through an executor while tracking a
//! model, and checks that the store, the synchronizer's mirror and the model
//! agree.

use crate::fixtures::{registry_with, stops_schema, TestStore};
use crate::generators::RowOp;
use crate::recorder::RecordingSynchronizer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tablesync_core::{fetch_all, Guards, TableSynchronizer};

/// A test harness for mirror consistency.
pub struct MirrorHarness {
    /// The store.
    pub store: TestStore,
    /// The `stops` synchronizer.
    pub stops: Arc<RecordingSynchronizer>,
    model: BTreeMap<i64, String>,
}

impl MirrorHarness {
    /// Creates a harness over an in-memory store.
    pub fn new() -> Self {
        let stops = Arc::new(RecordingSynchronizer::new(stops_schema()));
        let store = TestStore::memory(registry_with(vec![stops.clone() as Arc<dyn TableSynchronizer>]));
        Self {
            store,
            stops,
            model: BTreeMap::new(),
        }
    }

    /// Applies one mutation, synchronously or not.
    pub fn apply(&mut self, op: &RowOp, asynchronous: bool) {
        op.apply(&self.store, asynchronous).expect("Failed to apply operation");
        op.apply_to_model(&mut self.model);
    }

    /// Applies mutations in one transaction, committing or rolling back.
    pub fn apply_batch(&mut self, ops: &[RowOp], commit: bool) {
        let executor = self.store.executor.clone();
        let result = executor.exec_transaction(Guards::Enforced, true, |_| {
            for op in ops {
                op.apply(&executor, true)?;
            }
            if commit {
                Ok(())
            } else {
                Err(tablesync_core::CoreError::invalid_operation("rolled back by test"))
            }
        });
        assert_eq!(result.is_ok(), commit);
        if commit {
            for op in ops {
                op.apply_to_model(&mut self.model);
            }
        }
    }

    /// Drains the queue.
    pub fn drain(&self) -> usize {
        self.store.drain().expect("Failed to drain")
    }

    /// The model.
    pub fn model(&self) -> &BTreeMap<i64, String> {
        &self.model
    }

    /// Asserts that store, mirror and model hold the same rows.
    pub fn verify(&self) {
        let stored: BTreeMap<i64, String> = self
            .store
            .with_connection(|conn| fetch_all(conn, &stops_schema()))
            .expect("Failed to read stops")
            .iter()
            .map(|row| {
                (
                    row.get_i64("id").expect("row without id"),
                    row.get_text("name").unwrap_or_default().to_string(),
                )
            })
            .collect();
        assert_eq!(stored, self.model, "store does not match model");

        let mirrored: BTreeMap<i64, String> = self
            .stops
            .mirror()
            .iter()
            .map(|(id, row)| (*id, row.get_text("name").unwrap_or_default().to_string()))
            .collect();
        assert_eq!(mirrored, self.model, "mirror does not match model");
    }
}

impl Default for MirrorHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_tracks_synchronous_writes() {
        let mut harness = MirrorHarness::new();
        harness.apply(&RowOp::Insert { id: 1, name: "Central".into() }, false);
        harness.apply(&RowOp::Update { id: 1, name: "Main".into() }, false);
        harness.verify();
        assert_eq!(harness.model().len(), 1);
    }

    #[test]
    fn rolled_back_batch_leaves_nothing_behind() {
        let mut harness = MirrorHarness::new();
        harness.apply_batch(&[RowOp::Insert { id: 1, name: "A".into() }], false);
        assert_eq!(harness.drain(), 0);
        harness.verify();
        assert!(harness.stops.calls().is_empty());
    }
}
