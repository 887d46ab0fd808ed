//! A replicating node.
//!
//! [`ReplicationNode`] ties the pieces together: local writes go through
//! [`execute`](ReplicationNode::execute), which applies the statement and
//! logs it as APPLIED in one transaction; remote records arrive through
//! [`ingest`](ReplicationNode::ingest) or are pulled from a peer by
//! [`catch_up`](ReplicationNode::catch_up), and are replayed in log order.

use crate::clock::{NodeClock, NodeId, Timestamp};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::log::{insert_record, next_index, CursorPosition, ReplicationLog, UpdateLogTable};
use crate::peer::PeerTransport;
use crate::record::{Statement, UpdateRecord, UpdateState};
use crate::replay::{ReplayReport, Replayer};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use tablesync_core::{ChangeQueueExecutor, CoreError, ExecutorConfig, Guards, SyncRegistry};
use tracing::{debug, info, warn};

/// Outcome of [`ReplicationNode::ingest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Records newly stored.
    pub appended: usize,
    /// Records already present.
    pub duplicates: usize,
    /// The replay pass that followed.
    pub replay: ReplayReport,
}

/// Outcome of [`ReplicationNode::catch_up`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpReport {
    /// Records received from the peer.
    pub fetched: usize,
    /// Records newly stored.
    pub appended: usize,
    /// Of those, records fetched to fill index gaps.
    pub gap_filled: usize,
    /// The replay pass that followed.
    pub replay: ReplayReport,
}

/// One node of a replicating group.
pub struct ReplicationNode {
    config: ReplicationConfig,
    clock: NodeClock,
    log: Arc<ReplicationLog>,
    replayer: Replayer,
}

impl ReplicationNode {
    /// Registers the log table, starts an executor and attaches to it.
    ///
    /// Every other synchronizer must already be in `registry`.
    ///
    /// # Errors
    ///
    /// Returns registration and initialization errors.
    pub fn open(
        config: ReplicationConfig,
        executor_config: ExecutorConfig,
        registry: Arc<SyncRegistry>,
    ) -> ReplicationResult<Self> {
        let table = UpdateLogTable::register(&registry)?;
        let executor = Arc::new(ChangeQueueExecutor::new(executor_config, registry));
        executor.initialize()?;
        Self::attach(config, table, executor)
    }

    /// Attaches to an initialized executor whose registry holds `table`.
    ///
    /// The clock is moved past every timestamp already in the log.
    ///
    /// # Errors
    ///
    /// Returns storage errors from reading the log.
    pub fn attach(
        config: ReplicationConfig,
        table: Arc<UpdateLogTable>,
        executor: Arc<ChangeQueueExecutor>,
    ) -> ReplicationResult<Self> {
        let log = Arc::new(ReplicationLog::new(table, executor, config.page_size));
        let clock = NodeClock::new();
        if let Some(newest) = log.max_timestamp()? {
            clock.observe(newest);
        }
        let replayer = Replayer::new(log.clone(), config.conflict_policy, config.retry.clone());
        info!(node = %config.node_id, policy = config.conflict_policy.as_str(), "replication node attached");
        Ok(Self {
            config,
            clock,
            log,
            replayer,
        })
    }

    /// Replaces the clock, keeping it past every timestamp seen so far.
    #[must_use]
    pub fn with_clock(mut self, clock: NodeClock) -> Self {
        clock.observe(self.clock.last());
        self.clock = clock;
        self
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// The clock.
    pub fn clock(&self) -> &NodeClock {
        &self.clock
    }

    /// The log.
    pub fn log(&self) -> &Arc<ReplicationLog> {
        &self.log
    }

    /// The executor.
    pub fn executor(&self) -> &Arc<ChangeQueueExecutor> {
        self.log.executor()
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Applies a statement locally and logs it.
    ///
    /// The write and its APPLIED record commit together; on failure neither
    /// does and no index is consumed. Returns the logged record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` for a malformed statement, `Core` if the
    /// statement itself fails, and `Write` if the record is rejected.
    pub fn execute(&self, statement: Statement) -> ReplicationResult<UpdateRecord> {
        statement.validate()?;
        let node = self.node_id();
        let mut applied = false;
        let result = self
            .executor()
            .exec_transaction(Guards::Enforced, false, |conn| {
                statement.apply(conn)?;
                applied = true;
                let index = next_index(conn, node)?;
                let record = UpdateRecord {
                    state: UpdateState::Applied,
                    ..UpdateRecord::new(self.clock.now(), node, index, statement)
                };
                insert_record(conn, &record)?;
                Ok(record)
            });
        match result {
            Ok(record) => {
                debug!(%node, index = record.index, timestamp = %record.timestamp, "local update logged");
                Ok(record)
            }
            Err(err @ CoreError::Timeout { .. }) => Err(ReplicationError::Core(err)),
            Err(err) if applied => Err(ReplicationError::Write(err)),
            Err(err) => Err(ReplicationError::Core(err)),
        }
    }

    // ========================================================================
    // Remote records
    // ========================================================================

    /// Stores records received from elsewhere and runs one replay pass.
    ///
    /// Records are stored as PENDING whatever state they were sent in;
    /// records already present are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if any record is malformed (nothing is
    /// stored then), `Write` if the store rejects the batch, and replay
    /// errors.
    pub fn ingest(&self, records: &[UpdateRecord]) -> ReplicationResult<IngestReport> {
        let appended = self.store(records)?;
        let replay = self.replayer.replay_pending()?;
        Ok(IngestReport {
            appended,
            duplicates: records.len() - appended,
            replay,
        })
    }

    fn store(&self, records: &[UpdateRecord]) -> ReplicationResult<usize> {
        for record in records {
            record.statement.validate()?;
        }
        let received: Vec<UpdateRecord> = records.iter().map(UpdateRecord::as_received).collect();
        let appended = self
            .executor()
            .exec_transaction(Guards::Enforced, false, |conn| {
                let mut appended = 0;
                for record in &received {
                    appended += insert_record(conn, record)?;
                }
                Ok(appended)
            })
            .map_err(|err| match err {
                CoreError::Timeout { .. } => ReplicationError::Core(err),
                other => ReplicationError::Write(other),
            })?;
        for record in records {
            self.clock.observe(record.timestamp);
        }
        Ok(appended)
    }

    /// Runs one replay pass over the pending records.
    ///
    /// # Errors
    ///
    /// As [`Replayer::replay_pending`].
    pub fn replay(&self) -> ReplicationResult<ReplayReport> {
        self.replayer.replay_pending()
    }

    /// Replays until every pending record is applied or parked.
    ///
    /// # Errors
    ///
    /// As [`Replayer::replay_until_settled`].
    pub fn replay_until_settled(&self) -> ReplicationResult<ReplayReport> {
        self.replayer.replay_until_settled()
    }

    /// Pulls everything this node is missing from a peer, then replays.
    ///
    /// Reads the peer's log from the newest foreign timestamp already held
    /// (inclusive), then compares per-node indexes with the peer's
    /// high-water marks and fetches every hole by index. Records that
    /// arrived at the peer late, with old timestamps, are found that way.
    ///
    /// # Errors
    ///
    /// Returns transport errors once retries are exhausted, plus store and
    /// replay errors.
    pub fn catch_up(&self, peer: &dyn PeerTransport) -> ReplicationResult<CatchUpReport> {
        let mut report = CatchUpReport::default();
        let since = self
            .log
            .max_foreign_timestamp(self.node_id())?
            .unwrap_or(Timestamp::ZERO);
        let mut position = CursorPosition::Start {
            timestamp: since,
            inclusive: true,
        };

        loop {
            let page = self.with_retry(|| peer.fetch_page(&position, self.config.page_size))?;
            let Some(last) = page.last() else {
                break;
            };
            position = CursorPosition::after(last);
            report.fetched += page.len();
            report.appended += self.store(&page)?;
            if page.len() < self.config.page_size {
                break;
            }
        }

        for (node, peer_last) in self.with_retry(|| peer.high_water_marks())? {
            if node == self.node_id() {
                continue;
            }
            let mut holes = self.log.gaps(node)?;
            holes.extend(self.log.missing_range(node, peer_last)?);
            for hole in holes {
                let records = self.with_retry(|| peer.fetch_range(node, hole.clone()))?;
                if records.is_empty() {
                    continue;
                }
                debug!(%node, first = hole.start(), last = hole.end(), found = records.len(), "filling index gap");
                report.fetched += records.len();
                let appended = self.store(&records)?;
                report.appended += appended;
                report.gap_filled += appended;
            }
        }

        report.replay = self.replayer.replay_pending()?;
        info!(
            node = %self.node_id(),
            fetched = report.fetched,
            appended = report.appended,
            gap_filled = report.gap_filled,
            applied = report.replay.applied,
            "catch-up finished"
        );
        Ok(report)
    }

    fn with_retry<T>(&self, mut call: impl FnMut() -> ReplicationResult<T>) -> ReplicationResult<T> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "peer call failed, retrying");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for ReplicationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationNode")
            .field("node_id", &self.config.node_id)
            .field("policy", &self.config.conflict_policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::peer::MockPeer;
    use std::time::Duration;
    use tablesync_core::Row;

    fn node() -> ReplicationNode {
        let config = ReplicationConfig::new(NodeId::random())
            .with_retry(RetryConfig::new(3).with_initial_delay(Duration::ZERO));
        let node = ReplicationNode::open(config, ExecutorConfig::new(), Arc::new(SyncRegistry::new())).unwrap();
        node.executor()
            .exec_update("CREATE TABLE stops (id INTEGER PRIMARY KEY, name TEXT)", [], false)
            .unwrap();
        node
    }

    fn stop(id: i64, name: &str) -> Statement {
        Statement::upsert("stops", "id", Row::new().with("id", id).with("name", name))
    }

    #[test]
    fn execute_applies_and_logs() {
        let node = node();
        let first = node.execute(stop(1, "Central")).unwrap();
        let second = node.execute(Statement::delete("stops", "id", 1)).unwrap();

        assert_eq!((first.index, second.index), (1, 2));
        assert!(second.timestamp > first.timestamp);
        assert_eq!(first.state, UpdateState::Applied);
        assert_eq!(node.log().last_update_index(node.node_id()).unwrap(), Some(2));
        assert_eq!(node.log().last_pending_timestamp().unwrap(), None);
    }

    #[test]
    fn failed_execute_consumes_no_index() {
        let node = node();
        let err = node.execute(Statement::sql("INSERT INTO nowhere VALUES (1)")).unwrap_err();
        assert!(matches!(err, ReplicationError::Core(CoreError::Storage(_))));
        assert!(node.log().is_empty().unwrap());

        assert_eq!(node.execute(stop(1, "Central")).unwrap().index, 1);
    }

    #[test]
    fn ingest_ignores_redelivery() {
        let source = node();
        let sink = node();
        let record = source.execute(stop(1, "Central")).unwrap();

        let first = sink.ingest(&[record.clone()]).unwrap();
        assert_eq!(first.appended, 1);
        assert_eq!(first.replay.applied, 1);

        let again = sink.ingest(&[record]).unwrap();
        assert_eq!(again.duplicates, 1);
        assert_eq!(again.replay, ReplayReport::default());
    }

    #[test]
    fn ingest_advances_the_clock() {
        let sink = node();
        let far_future = Timestamp::from_millis(u64::MAX / 4);
        let record = UpdateRecord::new(far_future, NodeId::random(), 1, stop(1, "Central"));

        sink.ingest(&[record]).unwrap();
        assert!(sink.execute(stop(2, "North")).unwrap().timestamp > far_future);
    }

    #[test]
    fn catch_up_retries_transient_failures() {
        let source = node();
        let sink = node();
        let record = source.execute(stop(1, "Central")).unwrap();
        let peer = MockPeer::with_records(vec![record]);
        peer.fail_next(2);

        let report = sink.catch_up(&peer).unwrap();
        assert_eq!(report.appended, 1);
        assert_eq!(report.replay.applied, 1);
    }

    #[test]
    fn catch_up_gives_up_when_disconnected() {
        let sink = node();
        let peer = MockPeer::new();
        peer.set_connected(false);

        let err = sink.catch_up(&peer).unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { retryable: false, .. }));
        assert_eq!(peer.calls(), 1);
    }
}
