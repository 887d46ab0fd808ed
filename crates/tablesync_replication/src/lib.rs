//! # TableSync Replication
//!
//! Propagates mutations between nodes that each keep their own store.
//!
//! This crate provides:
//! - Per-node monotonic timestamps and node identities
//! - Update records with a CBOR wire format
//! - The replication log, persisted in the same store as the data it
//!   describes, with lazy restartable reads
//! - Replay with bounded retries, parking and a conflict policy
//! - Peer catch-up through the [`PeerTransport`] trait
//!
//! ## Ordering
//!
//! Records are totally ordered by `(timestamp, emitting node, index)`. A
//! node's own records carry consecutive indexes starting at 1, which is how
//! a receiver notices that something is missing.
//!
//! ## Key Invariants
//!
//! - A local write and its log record commit in one transaction
//! - Record state only moves PENDING→APPLIED or PENDING→FAILED
//! - Redelivering a record never applies it twice
//! - Replay applies records in log order; a row with an unresolved failure
//!   holds back later records for that row
//!
//! ## Usage
//!
//! ```rust,ignore
//! let node = ReplicationNode::open(
//!     ReplicationConfig::new(NodeId::random()),
//!     ExecutorConfig::at("node.db"),
//!     registry,
//! )?;
//! node.execute(Statement::upsert("stops", "id", row))?;
//! node.catch_up(&LoopbackPeer::new(other.log().clone()))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod log;
mod node;
mod peer;
mod record;
mod replay;

pub use clock::{NodeClock, NodeId, Timestamp};
pub use config::{ConflictPolicy, ReplicationConfig, RetryConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use log::{
    log_schema, Appended, CursorPosition, ReplicationLog, StateCounts, UpdateCursor, UpdateLogTable,
    LOG_RANK, LOG_TABLE,
};
pub use node::{CatchUpReport, IngestReport, ReplicationNode};
pub use peer::{LoopbackPeer, MockPeer, PeerTransport};
pub use record::{decode_batch, encode_batch, Statement, UpdateRecord, UpdateState};
pub use replay::{ReplayReport, Replayer};
