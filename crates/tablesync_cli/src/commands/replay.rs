//! Replay command implementation.

use super::open_node;
use crate::error::CliResult;
use std::path::Path;
use tablesync_replication::NodeId;
use tracing::info;

/// Replays pending records until they apply or park.
///
/// Only tables the log's statements write to are touched; no synchronizers
/// are registered, so nothing is mirrored.
pub fn run(path: &Path, node: Option<NodeId>, format: &str) -> CliResult<()> {
    let node = open_node(path, node)?;
    let before = node.log().count_by_state()?;
    info!(pending = before.pending, "replaying");

    let report = node.replay_until_settled()?;
    let after = node.log().count_by_state()?;
    node.executor().finalize()?;

    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "report": report,
                "states": after,
            }))?
        ),
        _ => {
            println!("Replayed log at {path:?}");
            println!(
                "  applied: {}, skipped: {}, retried: {}, parked: {}, blocked: {}",
                report.applied, report.skipped, report.retried, report.parked, report.blocked
            );
            if report.waiting > 0 {
                println!("  waiting for missing indexes: {}", report.waiting);
            }
            println!(
                "  now pending: {}, applied: {}, failed: {}",
                after.pending, after.applied, after.failed
            );
        }
    }
    Ok(())
}
