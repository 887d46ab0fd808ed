//! The replication log.
//!
//! Every update record lives in `tablesync_update_log`, in the same store
//! as the tables it mutates, so a local write and its record commit
//! together. The log is itself a synchronized table: its synchronizer keeps
//! the per-node high-water marks current as records arrive.
//!
//! Reads are lazy. [`ReplicationLog::load_all_after_timestamp`] returns an
//! [`UpdateCursor`] that fetches one page at a time with a keyset query on
//! `(timestamp, node_id, node_index)`; its [`position`](UpdateCursor::position)
//! can be kept and handed back to [`ReplicationLog::resume`].

use crate::clock::{NodeId, Timestamp};
use crate::error::{ReplicationError, ReplicationResult};
use crate::record::{UpdateRecord, UpdateState};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tablesync_core::{
    CallbackResult, ChangeQueueExecutor, ColumnType, CoreError, CoreResult, Guards, Row,
    SchemaDescriptor, SyncRegistry, TableSynchronizer,
};
use tracing::{debug, error, trace};

/// Name of the log table.
pub const LOG_TABLE: &str = "tablesync_update_log";

/// Registration rank of the log table.
///
/// `~` sorts after digits and letters, so the log bootstraps after the
/// tables its statements target.
pub const LOG_RANK: &str = "~tablesync_update_log";

const SELECT_RECORD: &str = "SELECT timestamp, node_id, node_index, state, attempts, statement, error \
     FROM tablesync_update_log";

const ORDER: &str = "ORDER BY timestamp, node_id, node_index";

/// Descriptor of the log table.
pub fn log_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(LOG_TABLE)
        .column("id", ColumnType::Integer)
        .read_only_column("timestamp", ColumnType::Integer)
        .read_only_column("node_id", ColumnType::Text)
        .read_only_column("node_index", ColumnType::Integer)
        .column("state", ColumnType::Integer)
        .column("attempts", ColumnType::Integer)
        .read_only_column("statement", ColumnType::Blob)
        .column("error", ColumnType::Text)
        .read_only_column("target_table", ColumnType::Text)
        .read_only_column("target_row", ColumnType::Integer)
        .unique_index("tablesync_update_log_origin", &["node_id", "node_index"])
        .index("tablesync_update_log_order", &["timestamp", "node_id", "node_index"])
        .index("tablesync_update_log_target", &["target_table", "target_row"])
        .index("tablesync_update_log_state", &["state"])
        .allow_remove(false)
}

// ============================================================================
// Log table synchronizer
// ============================================================================

/// Synchronizer of the log table.
///
/// Tracks the highest index stored per emitting node.
pub struct UpdateLogTable {
    schema: SchemaDescriptor,
    high_water: RwLock<HashMap<NodeId, u64>>,
}

impl UpdateLogTable {
    /// Creates the synchronizer.
    pub fn new() -> Self {
        Self {
            schema: log_schema(),
            high_water: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the synchronizer and registers it.
    ///
    /// # Errors
    ///
    /// Fails if the registry is closed or already holds the log table.
    pub fn register(registry: &SyncRegistry) -> ReplicationResult<Arc<Self>> {
        let table = Arc::new(Self::new());
        registry.add_table_synchronizer(LOG_RANK, table.clone())?;
        Ok(table)
    }

    /// Highest stored index per node, sorted by node.
    pub fn high_water_marks(&self) -> Vec<(NodeId, u64)> {
        let mut marks: Vec<(NodeId, u64)> =
            self.high_water.read().iter().map(|(node, index)| (*node, *index)).collect();
        marks.sort();
        marks
    }

    fn observe(&self, node: NodeId, index: u64) {
        let mut marks = self.high_water.write();
        let mark = marks.entry(node).or_insert(0);
        if index > *mark {
            *mark = index;
        }
    }
}

impl Default for UpdateLogTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpdateLogTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLogTable")
            .field("nodes", &self.high_water.read().len())
            .finish_non_exhaustive()
    }
}

impl TableSynchronizer for UpdateLogTable {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    // The log can be large; only the per-node maximum matters here.
    fn bootstrap_sync(&self, conn: &Connection) -> CoreResult<usize> {
        let mut stmt = conn.prepare(&format!(
            "SELECT node_id, MAX(node_index), COUNT(*) FROM {LOG_TABLE} GROUP BY node_id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut total = 0;
        while let Some(row) = rows.next()? {
            let node: NodeId = row.get(0)?;
            let index: u64 = row.get(1)?;
            let count: i64 = row.get(2)?;
            self.observe(node, index);
            total += usize::try_from(count).unwrap_or_default();
        }
        debug!(records = total, nodes = self.high_water.read().len(), "replication log loaded");
        Ok(total)
    }

    fn rows_added(&self, rows: &[Row], _is_first_sync: bool) -> CallbackResult {
        for row in rows {
            let node: NodeId = row
                .get_text("node_id")
                .ok_or("log row without node_id")?
                .parse()?;
            let index = u64::try_from(row.get_i64("node_index").ok_or("log row without node_index")?)?;
            self.observe(node, index);
        }
        Ok(())
    }

    fn rows_updated(&self, rows: &[Row]) -> CallbackResult {
        trace!(rows = rows.len(), "log entries changed state");
        Ok(())
    }

    fn rows_removed(&self, _rows: &[Row]) -> CallbackResult {
        Ok(())
    }
}

// ============================================================================
// Cursor positions
// ============================================================================

/// Where a log read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// At a timestamp.
    Start {
        /// Lower bound.
        timestamp: Timestamp,
        /// Whether records at exactly `timestamp` are included.
        inclusive: bool,
    },
    /// Strictly after a record.
    After {
        /// Timestamp of the last record read.
        timestamp: Timestamp,
        /// Emitting node of the last record read.
        node: NodeId,
        /// Index of the last record read.
        index: u64,
    },
}

impl CursorPosition {
    /// Position just past a record.
    pub fn after(record: &UpdateRecord) -> Self {
        CursorPosition::After {
            timestamp: record.timestamp,
            node: record.emitting_node,
            index: record.index,
        }
    }
}

/// Lazy iterator over the log in `(timestamp, node, index)` order.
pub struct UpdateCursor<'a> {
    log: &'a ReplicationLog,
    position: CursorPosition,
    fetched: CursorPosition,
    buffer: VecDeque<UpdateRecord>,
    exhausted: bool,
}

impl<'a> UpdateCursor<'a> {
    fn new(log: &'a ReplicationLog, position: CursorPosition) -> Self {
        Self {
            log,
            position,
            fetched: position,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position after the last record yielded.
    pub fn position(&self) -> CursorPosition {
        self.position
    }
}

impl Iterator for UpdateCursor<'_> {
    type Item = ReplicationResult<UpdateRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.log.page(&self.fetched, self.log.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.log.page_size;
                    if let Some(last) = page.last() {
                        self.fetched = CursorPosition::after(last);
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        let record = self.buffer.pop_front()?;
        self.position = CursorPosition::after(&record);
        Some(Ok(record))
    }
}

impl std::fmt::Debug for UpdateCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCursor")
            .field("position", &self.position)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Replication log
// ============================================================================

/// Outcome of [`ReplicationLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// The record was stored.
    Inserted,
    /// A record with the same origin and index was already stored.
    Duplicate,
}

/// Number of records in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    /// Waiting to be applied.
    pub pending: u64,
    /// Applied.
    pub applied: u64,
    /// Parked.
    pub failed: u64,
}

impl StateCounts {
    /// Total records.
    pub fn total(&self) -> u64 {
        self.pending + self.applied + self.failed
    }
}

/// Access to the persisted update records.
pub struct ReplicationLog {
    table: Arc<UpdateLogTable>,
    executor: Arc<ChangeQueueExecutor>,
    page_size: usize,
}

impl ReplicationLog {
    /// Wraps a registered log table and the executor that owns its store.
    pub fn new(table: Arc<UpdateLogTable>, executor: Arc<ChangeQueueExecutor>, page_size: usize) -> Self {
        Self {
            table,
            executor,
            page_size: page_size.max(1),
        }
    }

    /// The executor.
    pub fn executor(&self) -> &Arc<ChangeQueueExecutor> {
        &self.executor
    }

    /// Records fetched per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Highest stored index per node, as seen by the log's synchronizer.
    pub fn high_water_marks(&self) -> Vec<(NodeId, u64)> {
        self.table.high_water_marks()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stores a record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` for a statement that can never apply and
    /// `Write` if the store rejects the insert.
    pub fn append(&self, record: &UpdateRecord) -> ReplicationResult<Appended> {
        record.statement.validate()?;
        let changed = self
            .executor
            .exec_transaction(Guards::Enforced, false, |conn| insert_record(conn, record))
            .map_err(write_error)?;
        if changed == 0 {
            trace!(node = %record.emitting_node, index = record.index, "duplicate update record");
            Ok(Appended::Duplicate)
        } else {
            Ok(Appended::Inserted)
        }
    }

    /// Moves a PENDING record to APPLIED.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound`, or `InvalidTransition` if the record is
    /// not PENDING.
    pub fn mark_applied(&self, node: NodeId, index: u64) -> ReplicationResult<()> {
        let changed = self
            .executor
            .exec_transaction(Guards::Enforced, false, |conn| set_applied(conn, node, index))?;
        if changed == 0 {
            return Err(self.transition_error(node, index, UpdateState::Applied));
        }
        Ok(())
    }

    /// Counts a failed apply attempt, parking the record at `max_attempts`.
    ///
    /// Returns the record's new state.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound`, or `InvalidTransition` if the record is
    /// not PENDING.
    pub fn record_failure(
        &self,
        node: NodeId,
        index: u64,
        message: &str,
        max_attempts: u32,
    ) -> ReplicationResult<UpdateState> {
        let state = self.executor.exec_transaction(Guards::Enforced, false, |conn| {
            count_failure(conn, node, index, message, max_attempts)
        })?;
        state.ok_or_else(|| self.transition_error(node, index, UpdateState::Failed))
    }

    fn transition_error(&self, node: NodeId, index: u64, to: UpdateState) -> ReplicationError {
        match self.get(node, index) {
            Ok(Some(record)) => ReplicationError::InvalidTransition {
                from: record.state,
                to,
            },
            Ok(None) => ReplicationError::RecordNotFound {
                node: node.to_string(),
                index,
            },
            Err(err) => err,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Lazily reads every record after `timestamp`, in log order.
    pub fn load_all_after_timestamp(&self, timestamp: Timestamp, inclusive: bool) -> UpdateCursor<'_> {
        UpdateCursor::new(self, CursorPosition::Start { timestamp, inclusive })
    }

    /// Continues a read from a saved position.
    pub fn resume(&self, position: CursorPosition) -> UpdateCursor<'_> {
        UpdateCursor::new(self, position)
    }

    /// Reads up to `limit` records from a position.
    ///
    /// # Errors
    ///
    /// Returns storage errors and undecodable rows.
    pub fn page(&self, from: &CursorPosition, limit: usize) -> ReplicationResult<Vec<UpdateRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = self.executor.with_connection(|conn| match *from {
            CursorPosition::Start {
                timestamp,
                inclusive: true,
            } => read_records(
                conn,
                &format!("{SELECT_RECORD} WHERE timestamp >= ?1 {ORDER} LIMIT ?2"),
                params![timestamp, limit],
            ),
            CursorPosition::Start {
                timestamp,
                inclusive: false,
            } => read_records(
                conn,
                &format!("{SELECT_RECORD} WHERE timestamp > ?1 {ORDER} LIMIT ?2"),
                params![timestamp, limit],
            ),
            CursorPosition::After {
                timestamp,
                node,
                index,
            } => read_records(
                conn,
                &format!(
                    "{SELECT_RECORD} WHERE (timestamp, node_id, node_index) > (?1, ?2, ?3) {ORDER} LIMIT ?4"
                ),
                params![timestamp, node, index, limit],
            ),
        })?;
        Ok(records)
    }

    /// Every PENDING record, in log order.
    ///
    /// # Errors
    ///
    /// Returns storage errors and undecodable rows.
    pub fn pending(&self) -> ReplicationResult<Vec<UpdateRecord>> {
        let records = self.executor.with_connection(|conn| {
            read_records(
                conn,
                &format!("{SELECT_RECORD} WHERE state = ?1 {ORDER}"),
                [UpdateState::Pending],
            )
        })?;
        Ok(records)
    }

    /// Records from one node with indexes in `range`, in index order.
    ///
    /// # Errors
    ///
    /// Returns storage errors and undecodable rows.
    pub fn range(&self, node: NodeId, range: RangeInclusive<u64>) -> ReplicationResult<Vec<UpdateRecord>> {
        let records = self.executor.with_connection(|conn| {
            read_records(
                conn,
                &format!(
                    "{SELECT_RECORD} WHERE node_id = ?1 AND node_index BETWEEN ?2 AND ?3 ORDER BY node_index"
                ),
                params![node, range.start(), range.end()],
            )
        })?;
        Ok(records)
    }

    /// One record by origin and index.
    ///
    /// # Errors
    ///
    /// Returns storage errors and undecodable rows.
    pub fn get(&self, node: NodeId, index: u64) -> ReplicationResult<Option<UpdateRecord>> {
        let record = self.executor.with_connection(|conn| {
            let record = conn
                .prepare_cached(&format!("{SELECT_RECORD} WHERE node_id = ?1 AND node_index = ?2"))?
                .query_row(params![node, index], record_from_row)
                .optional()?;
            Ok(record)
        })?;
        Ok(record)
    }

    /// Timestamp of the oldest PENDING record.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn last_pending_timestamp(&self) -> ReplicationResult<Option<Timestamp>> {
        self.scalar(
            &format!("SELECT MIN(timestamp) FROM {LOG_TABLE} WHERE state = ?1"),
            [UpdateState::Pending],
        )
    }

    /// Newest timestamp in the log.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn max_timestamp(&self) -> ReplicationResult<Option<Timestamp>> {
        self.scalar(&format!("SELECT MAX(timestamp) FROM {LOG_TABLE}"), [])
    }

    /// Newest timestamp among records not emitted by `node`.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn max_foreign_timestamp(&self, node: NodeId) -> ReplicationResult<Option<Timestamp>> {
        self.scalar(
            &format!("SELECT MAX(timestamp) FROM {LOG_TABLE} WHERE node_id <> ?1"),
            [node],
        )
    }

    /// Highest index stored for a node.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn last_update_index(&self, node: NodeId) -> ReplicationResult<Option<u64>> {
        self.scalar(
            &format!("SELECT MAX(node_index) FROM {LOG_TABLE} WHERE node_id = ?1"),
            [node],
        )
    }

    /// Indexes to fetch from a peer whose newest record from `node` is
    /// `peer_last`.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn missing_range(&self, node: NodeId, peer_last: u64) -> ReplicationResult<Option<RangeInclusive<u64>>> {
        let local = self.last_update_index(node)?.unwrap_or(0);
        Ok((peer_last > local).then(|| local + 1..=peer_last))
    }

    /// Holes in the stored index sequence of a node, including one before
    /// the first stored index.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn gaps(&self, node: NodeId) -> ReplicationResult<Vec<RangeInclusive<u64>>> {
        let gaps = self.executor.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT previous, node_index FROM ( \
                   SELECT node_index, LAG(node_index, 1, 0) OVER (ORDER BY node_index) AS previous \
                   FROM {LOG_TABLE} WHERE node_id = ?1) \
                 WHERE node_index > previous + 1"
            ))?;
            let gaps = stmt
                .query_map([node], |r| {
                    let previous: u64 = r.get(0)?;
                    let index: u64 = r.get(1)?;
                    Ok(previous + 1..=index - 1)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(gaps)
        })?;
        Ok(gaps)
    }

    /// Per node, the highest index `n` such that records `1..=n` are all
    /// stored. Zero when index 1 itself is missing.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn contiguous_indexes(&self) -> ReplicationResult<HashMap<NodeId, u64>> {
        let marks = self.executor.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT node_id, MAX(CASE WHEN node_index = position THEN node_index ELSE 0 END) FROM ( \
                   SELECT node_id, node_index, \
                          ROW_NUMBER() OVER (PARTITION BY node_id ORDER BY node_index) AS position \
                   FROM {LOG_TABLE}) \
                 GROUP BY node_id"
            ))?;
            let marks = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(marks)
        })?;
        Ok(marks)
    }

    /// Every node with stored records and its highest index, from the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn origins(&self) -> ReplicationResult<Vec<(NodeId, u64)>> {
        let origins = self.executor.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT node_id, MAX(node_index) FROM {LOG_TABLE} GROUP BY node_id ORDER BY node_id"
            ))?;
            let origins = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(origins)
        })?;
        Ok(origins)
    }

    /// Number of records per state.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn count_by_state(&self) -> ReplicationResult<StateCounts> {
        let counts = self.executor.with_connection(|conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT state, COUNT(*) FROM {LOG_TABLE} GROUP BY state"))?;
            let mut counts = StateCounts::default();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let state: UpdateState = row.get(0)?;
                let count: u64 = row.get(1)?;
                match state {
                    UpdateState::Pending => counts.pending = count,
                    UpdateState::Applied => counts.applied = count,
                    UpdateState::Failed => counts.failed = count,
                }
            }
            Ok(counts)
        })?;
        Ok(counts)
    }

    /// Total number of records.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn len(&self) -> ReplicationResult<u64> {
        Ok(self.count_by_state()?.total())
    }

    /// Returns true if the log holds no records.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn is_empty(&self) -> ReplicationResult<bool> {
        Ok(self.len()? == 0)
    }

    fn scalar<T, P>(&self, sql: &str, params: P) -> ReplicationResult<Option<T>>
    where
        T: rusqlite::types::FromSql,
        P: Params,
    {
        let value = self.executor.with_connection(|conn| {
            let value = conn
                .prepare_cached(sql)?
                .query_row(params, |r| r.get::<_, Option<T>>(0))?;
            Ok(value)
        })?;
        Ok(value)
    }
}

impl std::fmt::Debug for ReplicationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationLog")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection-level helpers, for use inside an open transaction
// ============================================================================

fn write_error(err: CoreError) -> ReplicationError {
    match err {
        // The write itself committed; only the wait for its events ran out.
        CoreError::Timeout { .. } => ReplicationError::Core(err),
        other => ReplicationError::Write(other),
    }
}

/// Inserts a record, ignoring a redelivered `(node, index)`.
pub(crate) fn insert_record(conn: &Connection, record: &UpdateRecord) -> CoreResult<usize> {
    let (target_table, target_row) = match record.statement.target() {
        Some((table, row)) => (Some(table), Some(row)),
        None => (None, None),
    };
    let changed = conn
        .prepare_cached(&format!(
            "INSERT INTO {LOG_TABLE} \
               (timestamp, node_id, node_index, state, attempts, statement, error, target_table, target_row) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(node_id, node_index) DO NOTHING"
        ))?
        .execute(params![
            record.timestamp,
            record.emitting_node,
            record.index,
            record.state,
            record.attempts,
            record.statement,
            record.last_error,
            target_table,
            target_row,
        ])?;
    Ok(changed)
}

/// Index the next local record of `node` takes.
pub(crate) fn next_index(conn: &Connection, node: NodeId) -> CoreResult<u64> {
    let index = conn
        .prepare_cached(&format!(
            "SELECT COALESCE(MAX(node_index), 0) + 1 FROM {LOG_TABLE} WHERE node_id = ?1"
        ))?
        .query_row([node], |r| r.get(0))?;
    Ok(index)
}

/// Moves a PENDING record to APPLIED; returns 0 if it was not PENDING.
pub(crate) fn set_applied(conn: &Connection, node: NodeId, index: u64) -> CoreResult<usize> {
    let changed = conn
        .prepare_cached(&format!(
            "UPDATE {LOG_TABLE} SET state = ?1, error = NULL \
             WHERE node_id = ?2 AND node_index = ?3 AND state = ?4"
        ))?
        .execute(params![UpdateState::Applied, node, index, UpdateState::Pending])?;
    Ok(changed)
}

/// Counts a failed attempt on a PENDING record; `None` if it was not
/// PENDING.
pub(crate) fn count_failure(
    conn: &Connection,
    node: NodeId,
    index: u64,
    message: &str,
    max_attempts: u32,
) -> CoreResult<Option<UpdateState>> {
    let changed = conn
        .prepare_cached(&format!(
            "UPDATE {LOG_TABLE} SET attempts = attempts + 1, error = ?1, \
               state = CASE WHEN attempts + 1 >= ?2 THEN ?3 ELSE state END \
             WHERE node_id = ?4 AND node_index = ?5 AND state = ?6"
        ))?
        .execute(params![
            message,
            max_attempts,
            UpdateState::Failed,
            node,
            index,
            UpdateState::Pending
        ])?;
    if changed == 0 {
        return Ok(None);
    }
    let (state, attempts): (UpdateState, u32) = conn
        .prepare_cached(&format!(
            "SELECT state, attempts FROM {LOG_TABLE} WHERE node_id = ?1 AND node_index = ?2"
        ))?
        .query_row(params![node, index], |r| Ok((r.get(0)?, r.get(1)?)))?;
    if state == UpdateState::Failed {
        error!(%node, index, attempts, error = message, "update record parked");
    }
    Ok(Some(state))
}

/// The first FAILED record ordered before `record` that targets the same
/// row, if any.
pub(crate) fn failed_predecessor(conn: &Connection, record: &UpdateRecord) -> CoreResult<Option<(NodeId, u64)>> {
    let Some((table, row)) = record.statement.target() else {
        return Ok(None);
    };
    let found = conn
        .prepare_cached(&format!(
            "SELECT node_id, node_index FROM {LOG_TABLE} \
             WHERE target_table = ?1 AND target_row = ?2 AND state = ?3 \
               AND (timestamp, node_id, node_index) < (?4, ?5, ?6) \
             {ORDER} LIMIT 1"
        ))?
        .query_row(
            params![
                table,
                row,
                UpdateState::Failed,
                record.timestamp,
                record.emitting_node,
                record.index
            ],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(found)
}

/// Parks a PENDING record without counting an attempt.
pub(crate) fn park_pending(conn: &Connection, node: NodeId, index: u64, reason: &str) -> CoreResult<usize> {
    let changed = conn
        .prepare_cached(&format!(
            "UPDATE {LOG_TABLE} SET state = ?1, error = ?2 \
             WHERE node_id = ?3 AND node_index = ?4 AND state = ?5"
        ))?
        .execute(params![UpdateState::Failed, reason, node, index, UpdateState::Pending])?;
    Ok(changed)
}

/// Returns true if the record's target row already took an APPLIED record
/// ordered after it by `(timestamp, node)`.
pub(crate) fn superseded(conn: &Connection, record: &UpdateRecord) -> CoreResult<bool> {
    let Some((table, row)) = record.statement.target() else {
        return Ok(false);
    };
    let newer = conn
        .prepare_cached(&format!(
            "SELECT EXISTS (SELECT 1 FROM {LOG_TABLE} \
               WHERE target_table = ?1 AND target_row = ?2 AND state = ?3 \
                 AND (timestamp, node_id) > (?4, ?5))"
        ))?
        .query_row(
            params![table, row, UpdateState::Applied, record.timestamp, record.emitting_node],
            |r| r.get(0),
        )?;
    Ok(newer)
}

fn read_records<P: Params>(conn: &Connection, sql: &str, params: P) -> CoreResult<Vec<UpdateRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let records = stmt
        .query_map(params, record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpdateRecord> {
    Ok(UpdateRecord {
        timestamp: row.get(0)?,
        emitting_node: row.get(1)?,
        index: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        statement: row.get(5)?,
        last_error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Statement;
    use tablesync_core::ExecutorConfig;

    fn open_log(page_size: usize) -> ReplicationLog {
        let registry = Arc::new(SyncRegistry::new());
        let table = UpdateLogTable::register(&registry).unwrap();
        let executor = Arc::new(ChangeQueueExecutor::new(ExecutorConfig::new(), registry));
        executor.initialize().unwrap();
        ReplicationLog::new(table, executor, page_size)
    }

    fn record(ts: u64, node: NodeId, index: u64) -> UpdateRecord {
        UpdateRecord::new(
            Timestamp::from_millis(ts),
            node,
            index,
            Statement::delete("stops", "id", i64::try_from(index).unwrap()),
        )
    }

    fn keys(records: &[UpdateRecord]) -> Vec<(u64, u64)> {
        records.iter().map(|r| (r.timestamp.as_millis(), r.index)).collect()
    }

    #[test]
    fn append_and_get() {
        let log = open_log(8);
        let node = NodeId::random();
        let rec = record(10, node, 1);

        assert_eq!(log.append(&rec).unwrap(), Appended::Inserted);
        assert_eq!(log.get(node, 1).unwrap(), Some(rec));
        assert_eq!(log.get(node, 2).unwrap(), None);
    }

    #[test]
    fn redelivery_is_a_duplicate() {
        let log = open_log(8);
        let node = NodeId::random();
        log.append(&record(10, node, 1)).unwrap();

        assert_eq!(log.append(&record(99, node, 1)).unwrap(), Appended::Duplicate);
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.get(node, 1).unwrap().unwrap().timestamp, Timestamp::from_millis(10));
    }

    #[test]
    fn invalid_statement_is_rejected() {
        let log = open_log(8);
        let bad = UpdateRecord::new(Timestamp::from_millis(1), NodeId::random(), 1, Statement::sql("  "));
        assert!(matches!(log.append(&bad), Err(ReplicationError::InvalidRecord(_))));
    }

    #[test]
    fn log_rows_are_read_only() {
        let log = open_log(8);
        let node = NodeId::random();
        log.append(&record(10, node, 1)).unwrap();

        let err = log
            .executor()
            .exec_update(&format!("UPDATE {LOG_TABLE} SET timestamp = 0"), [], false)
            .unwrap_err();
        assert!(err.to_string().contains("not updatable"));
        let err = log
            .executor()
            .exec_update(&format!("DELETE FROM {LOG_TABLE}"), [], false)
            .unwrap_err();
        assert!(err.to_string().contains("delete not allowed"));
    }

    #[test]
    fn cursor_reads_in_log_order_across_pages() {
        let log = open_log(2);
        let a = NodeId::random();
        let b = NodeId::random();
        log.append(&record(30, a, 3)).unwrap();
        log.append(&record(10, a, 1)).unwrap();
        log.append(&record(20, b, 1)).unwrap();
        log.append(&record(20, a, 2)).unwrap();
        log.append(&record(40, b, 2)).unwrap();

        let all: Vec<UpdateRecord> = log
            .load_all_after_timestamp(Timestamp::ZERO, false)
            .collect::<ReplicationResult<_>>()
            .unwrap();
        let mut expected: Vec<(Timestamp, NodeId, u64)> = all.iter().map(UpdateRecord::order_key).collect();
        expected.sort();
        assert_eq!(all.len(), 5);
        assert_eq!(all.iter().map(UpdateRecord::order_key).collect::<Vec<_>>(), expected);

        let after_20: Vec<UpdateRecord> = log
            .load_all_after_timestamp(Timestamp::from_millis(20), false)
            .collect::<ReplicationResult<_>>()
            .unwrap();
        assert_eq!(keys(&after_20), vec![(30, 3), (40, 2)]);

        let from_20 = log
            .load_all_after_timestamp(Timestamp::from_millis(20), true)
            .count();
        assert_eq!(from_20, 4);
    }

    #[test]
    fn cursor_resumes_where_it_stopped() {
        let log = open_log(2);
        let node = NodeId::random();
        for i in 1..=5 {
            log.append(&record(i * 10, node, i)).unwrap();
        }

        let mut cursor = log.load_all_after_timestamp(Timestamp::ZERO, false);
        let first: Vec<UpdateRecord> = cursor.by_ref().take(3).map(Result::unwrap).collect();
        assert_eq!(keys(&first), vec![(10, 1), (20, 2), (30, 3)]);
        let position = cursor.position();
        drop(cursor);

        log.append(&record(60, node, 6)).unwrap();
        let rest: Vec<UpdateRecord> = log.resume(position).map(Result::unwrap).collect();
        assert_eq!(keys(&rest), vec![(40, 4), (50, 5), (60, 6)]);
    }

    #[test]
    fn state_machine_is_one_way() {
        let log = open_log(8);
        let node = NodeId::random();
        log.append(&record(10, node, 1)).unwrap();
        log.append(&record(20, node, 2)).unwrap();

        assert_eq!(log.last_pending_timestamp().unwrap(), Some(Timestamp::from_millis(10)));
        log.mark_applied(node, 1).unwrap();
        assert_eq!(log.last_pending_timestamp().unwrap(), Some(Timestamp::from_millis(20)));

        let err = log.mark_applied(node, 1).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::InvalidTransition {
                from: UpdateState::Applied,
                to: UpdateState::Applied
            }
        ));
        let err = log.record_failure(node, 1, "boom", 3).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::InvalidTransition {
                from: UpdateState::Applied,
                to: UpdateState::Failed
            }
        ));
        assert!(matches!(
            log.mark_applied(node, 9),
            Err(ReplicationError::RecordNotFound { index: 9, .. })
        ));
    }

    #[test]
    fn failures_park_at_the_bound() {
        let log = open_log(8);
        let node = NodeId::random();
        log.append(&record(10, node, 1)).unwrap();

        assert_eq!(log.record_failure(node, 1, "first", 2).unwrap(), UpdateState::Pending);
        assert_eq!(log.record_failure(node, 1, "second", 2).unwrap(), UpdateState::Failed);

        let parked = log.get(node, 1).unwrap().unwrap();
        assert_eq!(parked.attempts, 2);
        assert_eq!(parked.last_error.as_deref(), Some("second"));
        assert!(log.mark_applied(node, 1).is_err());
        assert_eq!(log.last_pending_timestamp().unwrap(), None);
        assert_eq!(
            log.count_by_state().unwrap(),
            StateCounts {
                pending: 0,
                applied: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn index_gaps_and_missing_ranges() {
        let log = open_log(8);
        let node = NodeId::random();
        for i in [2, 3, 6, 7, 10] {
            log.append(&record(i * 10, node, i)).unwrap();
        }

        assert_eq!(log.last_update_index(node).unwrap(), Some(10));
        assert_eq!(log.gaps(node).unwrap(), vec![1..=1, 4..=5, 8..=9]);
        assert_eq!(log.missing_range(node, 14).unwrap(), Some(11..=14));
        assert_eq!(log.missing_range(node, 10).unwrap(), None);

        let other = NodeId::random();
        assert_eq!(log.last_update_index(other).unwrap(), None);
        assert_eq!(log.missing_range(other, 3).unwrap(), Some(1..=3));
        assert!(log.gaps(other).unwrap().is_empty());
    }

    #[test]
    fn contiguous_indexes_stop_at_the_first_gap() {
        let log = open_log(8);
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        for i in [1, 2, 3, 5] {
            log.append(&record(i * 10, a, i)).unwrap();
        }
        log.append(&record(10, b, 2)).unwrap();
        log.append(&record(10, c, 1)).unwrap();

        let marks = log.contiguous_indexes().unwrap();
        assert_eq!(marks.get(&a), Some(&3));
        assert_eq!(marks.get(&b), Some(&0));
        assert_eq!(marks.get(&c), Some(&1));

        log.append(&record(40, a, 4)).unwrap();
        assert_eq!(log.contiguous_indexes().unwrap().get(&a), Some(&5));
    }

    #[test]
    fn high_water_marks_follow_appends() {
        let log = open_log(8);
        let a = NodeId::random();
        let b = NodeId::random();
        log.append(&record(10, a, 1)).unwrap();
        log.append(&record(20, a, 4)).unwrap();
        log.append(&record(30, b, 2)).unwrap();

        let mut expected = vec![(a, 4), (b, 2)];
        expected.sort();
        assert_eq!(log.high_water_marks(), expected);
        assert_eq!(log.origins().unwrap(), expected);
        assert_eq!(log.max_foreign_timestamp(a).unwrap(), Some(Timestamp::from_millis(30)));
        assert_eq!(log.max_timestamp().unwrap(), Some(Timestamp::from_millis(30)));
    }

    #[test]
    fn high_water_marks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let node = NodeId::random();

        for round in 1..=2u64 {
            let registry = Arc::new(SyncRegistry::new());
            let table = UpdateLogTable::register(&registry).unwrap();
            let executor = Arc::new(ChangeQueueExecutor::new(ExecutorConfig::at(&path), registry));
            let report = executor.initialize().unwrap();
            let log = ReplicationLog::new(table, executor, 8);

            assert_eq!(report.tables[0].rows, usize::try_from(round - 1).unwrap());
            log.append(&record(round * 10, node, round)).unwrap();
            assert_eq!(log.high_water_marks(), vec![(node, round)]);
        }
    }
}
