//! A synchronizer that records every callback.
//!
//! Besides the raw call log it keeps a mirror: the in-memory object graph
//! a real consumer would build, keyed by primary key.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tablesync_core::{CallbackResult, Row, SchemaDescriptor, TableSynchronizer};

/// One recorded callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Callback {
    /// `rows_added`.
    Added {
        /// Delivered rows.
        rows: Vec<Row>,
        /// Whether this was bootstrap.
        first_sync: bool,
    },
    /// `rows_updated`.
    Updated {
        /// Delivered rows.
        rows: Vec<Row>,
    },
    /// `rows_removed`.
    Removed {
        /// Delivered keys.
        rows: Vec<Row>,
    },
}

impl Callback {
    /// Short name of the callback.
    pub fn kind(&self) -> &'static str {
        match self {
            Callback::Added { .. } => "added",
            Callback::Updated { .. } => "updated",
            Callback::Removed { .. } => "removed",
        }
    }

    /// Primary keys of the delivered rows.
    pub fn keys(&self, key_column: &str) -> Vec<i64> {
        let rows = match self {
            Callback::Added { rows, .. } | Callback::Updated { rows } | Callback::Removed { rows } => rows,
        };
        rows.iter().filter_map(|r| r.get_i64(key_column)).collect()
    }
}

/// Records callbacks and mirrors the table in memory.
pub struct RecordingSynchronizer {
    schema: SchemaDescriptor,
    ignore_first_sync: bool,
    failing: AtomicBool,
    calls: Mutex<Vec<Callback>>,
    mirror: Mutex<BTreeMap<i64, Row>>,
}

impl RecordingSynchronizer {
    /// Creates a recorder for a table.
    pub fn new(schema: SchemaDescriptor) -> Self {
        Self {
            schema,
            ignore_first_sync: false,
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            mirror: Mutex::new(BTreeMap::new()),
        }
    }

    /// Suppresses bootstrap callbacks.
    #[must_use]
    pub fn ignoring_first_sync(mut self) -> Self {
        self.ignore_first_sync = true;
        self
    }

    /// Makes every following callback fail after recording it.
    ///
    /// A failing callback leaves the mirror untouched.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every callback so far.
    pub fn calls(&self) -> Vec<Callback> {
        self.calls.lock().unwrap().clone()
    }

    /// Every callback so far, clearing the log.
    pub fn take_calls(&self) -> Vec<Callback> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    /// Primary keys in delivery order, tagged with the callback kind.
    pub fn deliveries(&self) -> Vec<(&'static str, i64)> {
        let key = self.primary_key_column().to_string();
        self.calls()
            .iter()
            .flat_map(|call| call.keys(&key).into_iter().map(move |id| (call.kind(), id)))
            .collect()
    }

    /// The mirrored table.
    pub fn mirror(&self) -> BTreeMap<i64, Row> {
        self.mirror.lock().unwrap().clone()
    }

    /// One mirrored row.
    pub fn mirrored(&self, id: i64) -> Option<Row> {
        self.mirror.lock().unwrap().get(&id).cloned()
    }

    fn record(&self, call: Callback) -> CallbackResult {
        let failing = self.failing.load(Ordering::SeqCst);
        if !failing {
            let key = self.primary_key_column().to_string();
            let mut mirror = self.mirror.lock().unwrap();
            match &call {
                Callback::Added { rows, .. } | Callback::Updated { rows } => {
                    for row in rows {
                        if let Some(id) = row.get_i64(&key) {
                            mirror.insert(id, row.clone());
                        }
                    }
                }
                Callback::Removed { rows } => {
                    for row in rows {
                        if let Some(id) = row.get_i64(&key) {
                            mirror.remove(&id);
                        }
                    }
                }
            }
        }
        self.calls.lock().unwrap().push(call);
        if failing {
            return Err(format!("injected failure in {}", self.schema.table_name()).into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecordingSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSynchronizer")
            .field("table", &self.schema.table_name())
            .field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default())
            .finish_non_exhaustive()
    }
}

impl TableSynchronizer for RecordingSynchronizer {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn ignore_callbacks_on_first_sync(&self) -> bool {
        self.ignore_first_sync
    }

    fn rows_added(&self, rows: &[Row], is_first_sync: bool) -> CallbackResult {
        self.record(Callback::Added {
            rows: rows.to_vec(),
            first_sync: is_first_sync,
        })
    }

    fn rows_updated(&self, rows: &[Row]) -> CallbackResult {
        self.record(Callback::Updated { rows: rows.to_vec() })
    }

    fn rows_removed(&self, rows: &[Row]) -> CallbackResult {
        self.record(Callback::Removed { rows: rows.to_vec() })
    }
}
