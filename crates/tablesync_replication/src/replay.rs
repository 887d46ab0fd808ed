//! Replay of pending update records.
//!
//! Pending records are applied one at a time in log order, each in its own
//! transaction together with its move to APPLIED, with guard triggers
//! bypassed. A record that fails is counted and stays PENDING until it
//! reaches the retry bound, at which point it is parked as FAILED. While a
//! row has an unresolved failure, later records for that row wait; once the
//! failure is parked, they are parked behind it.
//!
//! A record never applies before every earlier index from its origin is
//! stored. It waits, along with later records for the same row, until
//! catch-up fills the gap.

use crate::config::{ConflictPolicy, RetryConfig};
use crate::error::{ReplicationError, ReplicationResult};
use crate::clock::NodeId;
use crate::log::{failed_predecessor, park_pending, set_applied, superseded, ReplicationLog};
use crate::record::{UpdateRecord, UpdateState};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tablesync_core::{CoreError, Guards};
use tracing::{debug, error, info, trace, warn};

/// Outcome of one or more replay passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Records applied.
    pub applied: usize,
    /// Records marked APPLIED without effect under last-writer-wins.
    pub skipped: usize,
    /// Failures that left the record PENDING for another attempt.
    pub retried: usize,
    /// Records parked as FAILED.
    pub parked: usize,
    /// Records held back behind an earlier failure on the same row.
    pub blocked: usize,
    /// Records held back until a missing earlier index from their origin
    /// arrives, and later records for the same rows.
    pub waiting: usize,
}

impl ReplayReport {
    /// Returns true if another pass would change nothing.
    ///
    /// Waiting records only move once their gap is filled, so they do not
    /// count.
    pub fn is_settled(&self) -> bool {
        self.retried == 0 && self.blocked == 0
    }

    /// Adds another report's counts; `retried` and `blocked` reflect the
    /// latest pass only.
    pub fn absorb(&mut self, pass: ReplayReport) {
        self.applied += pass.applied;
        self.skipped += pass.skipped;
        self.parked += pass.parked;
        self.retried = pass.retried;
        self.blocked = pass.blocked;
        self.waiting = pass.waiting;
    }
}

enum Outcome {
    Applied,
    Skipped,
    Parked { behind: (NodeId, u64) },
}

/// Applies pending records from a log.
#[derive(Debug)]
pub struct Replayer {
    log: Arc<ReplicationLog>,
    policy: ConflictPolicy,
    retry: RetryConfig,
}

impl Replayer {
    /// Creates a replayer.
    pub fn new(log: Arc<ReplicationLog>, policy: ConflictPolicy, retry: RetryConfig) -> Self {
        Self { log, policy, retry }
    }

    /// Runs one pass over every PENDING record.
    ///
    /// # Errors
    ///
    /// Apply failures are recorded on the entry, not returned. Errors are
    /// returned when the log itself cannot be read or updated.
    pub fn replay_pending(&self) -> ReplicationResult<ReplayReport> {
        let pending = self.log.pending()?;
        if pending.is_empty() {
            return Ok(ReplayReport::default());
        }
        let contiguous = self.log.contiguous_indexes()?;
        let mut report = ReplayReport::default();
        let mut blocked: HashSet<(String, i64)> = HashSet::new();
        let mut held: HashSet<(String, i64)> = HashSet::new();

        for record in &pending {
            let target = record.statement.target().map(|(table, row)| (table.to_string(), row));
            if target.as_ref().is_some_and(|t| blocked.contains(t)) {
                trace!(node = %record.emitting_node, index = record.index, "held behind failed row");
                report.blocked += 1;
                continue;
            }
            let behind_gap = record.index > contiguous.get(&record.emitting_node).copied().unwrap_or(0);
            if behind_gap || target.as_ref().is_some_and(|t| held.contains(t)) {
                trace!(node = %record.emitting_node, index = record.index, "waiting for an earlier index");
                report.waiting += 1;
                if let Some(target) = target {
                    held.insert(target);
                }
                continue;
            }

            match self.apply(record) {
                Ok(Outcome::Applied) => report.applied += 1,
                Ok(Outcome::Skipped) => {
                    debug!(node = %record.emitting_node, index = record.index, "superseded record skipped");
                    report.skipped += 1;
                }
                Ok(Outcome::Parked { behind }) => {
                    error!(
                        node = %record.emitting_node,
                        index = record.index,
                        behind_node = %behind.0,
                        behind_index = behind.1,
                        "update record parked behind a failed record for the same row"
                    );
                    report.parked += 1;
                }
                Err(CoreError::Storage(err)) => {
                    let message = err.to_string();
                    warn!(
                        node = %record.emitting_node,
                        index = record.index,
                        attempt = record.attempts + 1,
                        error = %message,
                        "update record failed to apply"
                    );
                    let state = self.log.record_failure(
                        record.emitting_node,
                        record.index,
                        &message,
                        self.retry.max_attempts,
                    )?;
                    if state == UpdateState::Failed {
                        report.parked += 1;
                    } else {
                        report.retried += 1;
                        if let Some(target) = target {
                            blocked.insert(target);
                        }
                    }
                }
                Err(err) => return Err(ReplicationError::Core(err)),
            }
        }

        debug!(
            applied = report.applied,
            skipped = report.skipped,
            retried = report.retried,
            parked = report.parked,
            blocked = report.blocked,
            waiting = report.waiting,
            "replay pass finished"
        );
        Ok(report)
    }

    /// Runs passes until nothing is retried or blocked, sleeping between
    /// passes as the retry configuration says.
    ///
    /// Every failing record is parked after `max_attempts` passes, so this
    /// terminates.
    ///
    /// # Errors
    ///
    /// As [`replay_pending`](Self::replay_pending).
    pub fn replay_until_settled(&self) -> ReplicationResult<ReplayReport> {
        let mut total = ReplayReport::default();
        for pass in 0..=self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(pass);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            total.absorb(self.replay_pending()?);
            if total.is_settled() {
                break;
            }
        }
        if total.parked > 0 {
            info!(parked = total.parked, "replay settled with parked records");
        }
        Ok(total)
    }

    fn apply(&self, record: &UpdateRecord) -> Result<Outcome, CoreError> {
        let lww = self.policy == ConflictPolicy::LastWriterWins;
        self.log
            .executor()
            .exec_transaction(Guards::Bypassed, false, |conn| {
                if let Some(behind) = failed_predecessor(conn, record)? {
                    let reason = format!("blocked by failed update record {} from {}", behind.1, behind.0);
                    park_pending(conn, record.emitting_node, record.index, &reason)?;
                    return Ok(Outcome::Parked { behind });
                }
                let outcome = if lww && superseded(conn, record)? {
                    Outcome::Skipped
                } else {
                    record.statement.apply(conn)?;
                    Outcome::Applied
                };
                if set_applied(conn, record.emitting_node, record.index)? == 0 {
                    return Err(CoreError::invalid_operation(format!(
                        "update record {} from {} is no longer pending",
                        record.index, record.emitting_node
                    )));
                }
                Ok(outcome)
            })
    }
}
