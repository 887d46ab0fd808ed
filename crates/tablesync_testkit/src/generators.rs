//! Property-based test generators using proptest.
//!
//! Generates sequences of row mutations against the `stops` table, with a
//! plain map as the model they are checked against.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tablesync_core::{rusqlite::params, ChangeQueueExecutor, CoreResult};

/// One mutation of the `stops` table.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert a row unless the key exists.
    Insert {
        /// Key.
        id: i64,
        /// Name.
        name: String,
    },
    /// Rename an existing row.
    Update {
        /// Key.
        id: i64,
        /// New name.
        name: String,
    },
    /// Delete a row.
    Delete {
        /// Key.
        id: i64,
    },
}

impl RowOp {
    /// Executes the mutation and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns the executor's error.
    pub fn apply(&self, executor: &ChangeQueueExecutor, asynchronous: bool) -> CoreResult<usize> {
        match self {
            RowOp::Insert { id, name } => executor.exec_update(
                "INSERT OR IGNORE INTO stops (id, name) VALUES (?1, ?2)",
                params![id, name],
                asynchronous,
            ),
            RowOp::Update { id, name } => executor.exec_update(
                "UPDATE stops SET name = ?2 WHERE id = ?1",
                params![id, name],
                asynchronous,
            ),
            RowOp::Delete { id } => {
                executor.exec_update("DELETE FROM stops WHERE id = ?1", params![id], asynchronous)
            }
        }
    }

    /// Applies the mutation to a model of the table.
    pub fn apply_to_model(&self, model: &mut BTreeMap<i64, String>) {
        match self {
            RowOp::Insert { id, name } => {
                model.entry(*id).or_insert_with(|| name.clone());
            }
            RowOp::Update { id, name } => {
                if let Some(current) = model.get_mut(id) {
                    current.clone_from(name);
                }
            }
            RowOp::Delete { id } => {
                model.remove(id);
            }
        }
    }
}

/// Strategy for keys from a small range, so operations collide.
pub fn row_id_strategy() -> impl Strategy<Value = i64> {
    1..=12i64
}

/// Strategy for stop names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{0,9}( [A-Z][a-z]{0,9})?").expect("Invalid regex")
}

/// Strategy for a single mutation.
pub fn row_op_strategy() -> impl Strategy<Value = RowOp> {
    prop_oneof![
        3 => (row_id_strategy(), name_strategy()).prop_map(|(id, name)| RowOp::Insert { id, name }),
        2 => (row_id_strategy(), name_strategy()).prop_map(|(id, name)| RowOp::Update { id, name }),
        1 => row_id_strategy().prop_map(|id| RowOp::Delete { id }),
    ]
}

/// Strategy for a sequence of mutations.
pub fn op_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<RowOp>> {
    prop::collection::vec(row_op_strategy(), 1..=max_len.max(1))
}

/// Strategy for a sequence split into transactions.
pub fn transaction_batches_strategy(max_batches: usize) -> impl Strategy<Value = Vec<(Vec<RowOp>, bool)>> {
    prop::collection::vec((op_sequence_strategy(6), any::<bool>()), 1..=max_batches.max(1))
}
