//! Change events and the queue between native hooks and the drain loop.
//!
//! SQLite invokes its update hook synchronously inside the write call, so the
//! hook must never touch the connection. It receives an [`EventSink`], which
//! can only stage events; the executor's drain loop is the sole consumer of
//! the queue and the only place rows are re-queried.
//!
//! Events are staged per transaction and published on commit, so a rollback
//! never reaches a synchronizer.

use crate::registry::TableId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Row was inserted.
    Insert,
    /// Row was updated.
    Update,
    /// Row was deleted.
    Delete,
}

impl Operation {
    /// Lower-case name, for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A single committed row mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Queue sequence, assigned when the event is published.
    pub sequence: u64,
    /// Type of change.
    pub operation: Operation,
    /// Table the row belongs to.
    pub table_name: String,
    /// Resolved registry id, when the table was known at capture time.
    pub table: Option<TableId>,
    /// Primary key (SQLite rowid) of the row.
    pub row_id: i64,
}

impl ChangeEvent {
    /// Creates an unsequenced event.
    pub fn new(operation: Operation, table_name: impl Into<String>, row_id: i64) -> Self {
        Self {
            sequence: 0,
            operation,
            table_name: table_name.into(),
            table: None,
            row_id,
        }
    }

    /// Creates an insert event.
    pub fn insert(table_name: impl Into<String>, row_id: i64) -> Self {
        Self::new(Operation::Insert, table_name, row_id)
    }

    /// Creates an update event.
    pub fn update(table_name: impl Into<String>, row_id: i64) -> Self {
        Self::new(Operation::Update, table_name, row_id)
    }

    /// Creates a delete event.
    pub fn delete(table_name: impl Into<String>, row_id: i64) -> Self {
        Self::new(Operation::Delete, table_name, row_id)
    }
}

#[derive(Default)]
struct QueueState {
    /// Captured inside the open transaction, not yet committed.
    staged: Vec<ChangeEvent>,
    /// Committed, waiting for a drain.
    ready: VecDeque<ChangeEvent>,
    /// Last sequence handed out.
    last_sequence: u64,
    /// Every event up to this sequence has been dispatched.
    drained_through: u64,
}

/// FIFO of committed change events.
///
/// One lock guards both the staging area and the ready queue; it is held only
/// for push/pop, never across a callback or a statement.
#[derive(Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    arrived: Condvar,
    drained: Condvar,
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a committed event directly to the ready queue.
    ///
    /// Returns the sequence assigned to it.
    pub fn enqueue(&self, mut event: ChangeEvent) -> u64 {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        event.sequence = sequence;
        trace!(
            sequence = event.sequence,
            table = %event.table_name,
            row_id = event.row_id,
            op = event.operation.as_str(),
            "enqueued change event"
        );
        state.ready.push_back(event);
        drop(state);
        self.arrived.notify_all();
        sequence
    }

    fn stage(&self, event: ChangeEvent) {
        self.state.lock().staged.push(event);
    }

    fn publish_staged(&self) {
        let mut state = self.state.lock();
        if state.staged.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut state.staged);
        for mut event in staged {
            state.last_sequence += 1;
            event.sequence = state.last_sequence;
            state.ready.push_back(event);
        }
        drop(state);
        self.arrived.notify_all();
    }

    pub(crate) fn discard_staged(&self) {
        let mut state = self.state.lock();
        if !state.staged.is_empty() {
            trace!(discarded = state.staged.len(), "rollback discarded staged events");
            state.staged.clear();
        }
    }

    /// Pops the oldest ready event.
    pub fn pop(&self) -> Option<ChangeEvent> {
        self.state.lock().ready.pop_front()
    }

    /// Records that an event has been dispatched and wakes waiting writers.
    pub fn complete(&self, sequence: u64) {
        let mut state = self.state.lock();
        if sequence > state.drained_through {
            state.drained_through = sequence;
        }
        drop(state);
        self.drained.notify_all();
    }

    /// Last sequence handed out so far.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Highest sequence known to be dispatched.
    pub fn drained_through(&self) -> u64 {
        self.state.lock().drained_through
    }

    /// Number of ready events.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Returns true if no event is ready.
    pub fn is_empty(&self) -> bool {
        self.state.lock().ready.is_empty()
    }

    /// Blocks until every event up to `sequence` is dispatched.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_drained(&self, sequence: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.drained_through < sequence {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.drained_through >= sequence;
            }
        }
        true
    }

    /// Blocks until an event is ready or `timeout` elapses.
    ///
    /// Returns true if the queue is non-empty on return.
    pub fn wait_for_events(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.ready.is_empty() {
            let _ = self.arrived.wait_for(&mut state, timeout);
        }
        !state.ready.is_empty()
    }

    /// Wakes every thread blocked in [`EventQueue::wait_for_events`].
    pub fn wake(&self) {
        self.arrived.notify_all();
    }
}

/// Enqueue-only handle held by the native notification hooks.
///
/// A sink has no access to the connection; that separation is what keeps the
/// hooks from re-entering SQLite.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    tables: Arc<HashMap<String, TableId>>,
}

impl EventSink {
    /// Creates a sink over a queue and a frozen table-name map.
    pub fn new(queue: Arc<EventQueue>, tables: Arc<HashMap<String, TableId>>) -> Self {
        Self { queue, tables }
    }

    /// Stages a captured row change until its transaction commits.
    ///
    /// Changes to tables nobody registered for are dropped here.
    pub fn capture(&self, operation: Operation, table_name: &str, row_id: i64) {
        let Some(&table) = self.tables.get(table_name) else {
            trace!(table = table_name, row_id, "ignoring change to unregistered table");
            return;
        };
        let mut event = ChangeEvent::new(operation, table_name, row_id);
        event.table = Some(table);
        self.queue.stage(event);
    }

    /// Publishes staged events; called from the commit hook.
    pub fn commit(&self) {
        self.queue.publish_staged();
    }

    /// Discards staged events; called from the rollback hook.
    pub fn rollback(&self) {
        self.queue.discard_staged();
    }
}
