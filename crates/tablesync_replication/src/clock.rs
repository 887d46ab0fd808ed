//! Node identity and monotonic timestamps.
//!
//! Update records are ordered by `(timestamp, emitting node, index)`. The
//! timestamp is wall-clock milliseconds, bumped so it never repeats or goes
//! backwards on one node; the node id breaks ties between nodes.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch, monotonic per node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch; every real timestamp is after it.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        u64::column_result(value).map(Timestamp)
    }
}

/// Identifies a replicating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a random node id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = ReplicationError;

    fn from_str(s: &str) -> ReplicationResult<Self> {
        Uuid::parse_str(s)
            .map(NodeId)
            .map_err(|e| ReplicationError::InvalidRecord(format!("bad node id {s:?}: {e}")))
    }
}

// Stored as lower-case hyphenated text, whose byte order matches `Ord`.
impl ToSql for NodeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for NodeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Uuid::parse_str(text)
            .map(NodeId)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Hands out strictly increasing timestamps for one node.
pub struct NodeClock {
    last: Mutex<u64>,
    source: fn() -> u64,
}

impl NodeClock {
    /// Creates a clock backed by the system wall clock.
    pub fn new() -> Self {
        Self::with_source(wall_millis)
    }

    /// Creates a clock over a custom millisecond source.
    ///
    /// A source that always returns 0 turns the clock into a plain counter,
    /// which keeps tests deterministic.
    pub fn with_source(source: fn() -> u64) -> Self {
        Self {
            last: Mutex::new(0),
            source,
        }
    }

    /// Returns the next timestamp: `max(now, last + 1)`.
    pub fn now(&self) -> Timestamp {
        let wall = (self.source)();
        let mut last = self.last.lock();
        *last = wall.max(last.saturating_add(1));
        Timestamp(*last)
    }

    /// Moves the clock past a timestamp seen elsewhere.
    pub fn observe(&self, seen: Timestamp) {
        let mut last = self.last.lock();
        if seen.0 > *last {
            *last = seen.0;
        }
    }

    /// The last timestamp handed out or observed.
    pub fn last(&self) -> Timestamp {
        Timestamp(*self.last.lock())
    }
}

impl Default for NodeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeClock").field("last", &self.last()).finish()
    }
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
