//! Transport abstraction for pulling records from a peer.

use crate::clock::NodeId;
use crate::error::{ReplicationError, ReplicationResult};
use crate::log::{CursorPosition, ReplicationLog};
use crate::record::{decode_batch, encode_batch, UpdateRecord};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A peer whose replication log can be read.
pub trait PeerTransport: Send + Sync {
    /// Reads up to `limit` records from a position, in log order.
    fn fetch_page(&self, from: &CursorPosition, limit: usize) -> ReplicationResult<Vec<UpdateRecord>>;

    /// Highest index the peer holds for each node.
    fn high_water_marks(&self) -> ReplicationResult<Vec<(NodeId, u64)>>;

    /// Records of one node with indexes in `range`.
    fn fetch_range(&self, node: NodeId, range: RangeInclusive<u64>) -> ReplicationResult<Vec<UpdateRecord>>;
}

/// An in-process peer reading another node's log.
///
/// Every response travels through the batch wire encoding, as it would
/// over a network.
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    log: Arc<ReplicationLog>,
}

impl LoopbackPeer {
    /// Creates a peer over a log.
    pub fn new(log: Arc<ReplicationLog>) -> Self {
        Self { log }
    }
}

fn over_the_wire(records: &[UpdateRecord]) -> ReplicationResult<Vec<UpdateRecord>> {
    decode_batch(&encode_batch(records)?)
}

impl PeerTransport for LoopbackPeer {
    fn fetch_page(&self, from: &CursorPosition, limit: usize) -> ReplicationResult<Vec<UpdateRecord>> {
        over_the_wire(&self.log.page(from, limit)?)
    }

    fn high_water_marks(&self) -> ReplicationResult<Vec<(NodeId, u64)>> {
        self.log.origins()
    }

    fn fetch_range(&self, node: NodeId, range: RangeInclusive<u64>) -> ReplicationResult<Vec<UpdateRecord>> {
        over_the_wire(&self.log.range(node, range)?)
    }
}

/// A scripted peer for tests.
///
/// Serves a fixed set of records, can be disconnected, and can be told to
/// fail a number of upcoming calls with a retryable error.
#[derive(Debug, Default)]
pub struct MockPeer {
    records: Mutex<Vec<UpdateRecord>>,
    connected: AtomicBool,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockPeer {
    /// Creates a connected peer with no records.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Creates a connected peer serving `records`.
    pub fn with_records(records: Vec<UpdateRecord>) -> Self {
        let peer = Self::new();
        peer.set_records(records);
        peer
    }

    /// Replaces the served records.
    pub fn set_records(&self, mut records: Vec<UpdateRecord>) {
        records.sort_by_key(UpdateRecord::order_key);
        *self.records.lock() = records;
    }

    /// Removes a record, simulating one the peer never delivers.
    pub fn withhold(&self, node: NodeId, index: u64) {
        self.records
            .lock()
            .retain(|r| !(r.emitting_node == node && r.index == index));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of calls served or refused so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> ReplicationResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ReplicationError::transport_fatal("peer not connected"));
        }
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ReplicationError::transport_retryable("injected peer failure"));
        }
        Ok(())
    }
}

impl PeerTransport for MockPeer {
    fn fetch_page(&self, from: &CursorPosition, limit: usize) -> ReplicationResult<Vec<UpdateRecord>> {
        self.check()?;
        let records = self.records.lock();
        let page = records
            .iter()
            .filter(|r| match *from {
                CursorPosition::Start {
                    timestamp,
                    inclusive,
                } => r.timestamp > timestamp || (inclusive && r.timestamp == timestamp),
                CursorPosition::After {
                    timestamp,
                    node,
                    index,
                } => r.order_key() > (timestamp, node, index),
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(page)
    }

    fn high_water_marks(&self) -> ReplicationResult<Vec<(NodeId, u64)>> {
        self.check()?;
        let mut marks: Vec<(NodeId, u64)> = Vec::new();
        for record in self.records.lock().iter() {
            match marks.iter_mut().find(|(node, _)| *node == record.emitting_node) {
                Some((_, index)) => *index = (*index).max(record.index),
                None => marks.push((record.emitting_node, record.index)),
            }
        }
        marks.sort();
        Ok(marks)
    }

    fn fetch_range(&self, node: NodeId, range: RangeInclusive<u64>) -> ReplicationResult<Vec<UpdateRecord>> {
        self.check()?;
        let mut records: Vec<UpdateRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.emitting_node == node && range.contains(&r.index))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.index);
        Ok(records)
    }
}
