//! Swarmcheck consistency checks
//!
//! Drives a live swarm cluster through uploads, deletions and restarts,
//! and asserts that chunks end up where the DHT model in
//! [`swarmcheck_dht`] predicts.
//!
//! # Checks
//!
//! - [`PushSyncCheck`]: an upload reaches the node closest to the chunk.
//! - [`PullSyncCheck`]: every predicted replica eventually holds the chunk.
//! - [`ChunkRepairCheck`]: hinted retrieval restores a chunk left on one
//!   stray node.
//! - [`ReserveCheck`]: reserve eviction honours radius, value and pins.
//!
//! # Running
//!
//! ```text
//! config  = RunConfig::from_env()          SWARMCHECK_SEED, _TIMEOUT_SECS, ...
//! ctx     = CheckContext::start(&config)   seed + deadline for one invocation
//! report  = check.run(&cluster, &ctx)      Ok(report) or Err(CheckFailed(report))
//! ```
//!
//! Nodes are reached only through [`NodeHandle`], [`ClusterProvider`] and
//! [`NodeRestarter`]; transports live outside this crate.

mod checks;
mod cluster;
mod config;
mod error;
mod metrics;
mod node;
mod pool;
mod random;
mod report;
mod retry;
pub mod telemetry;

#[cfg(test)]
mod sim;

pub use checks::{
    Check, ChunkRepairCheck, ChunkRepairOptions, PullSyncCheck, PullSyncOptions, PushSyncCheck,
    PushSyncOptions, ReserveCheck, ReserveOptions,
};
pub use cluster::{capture_snapshot, fetch_peer_lists, find_node, sorted_nodes};
pub use config::{CheckContext, RunConfig};
pub use error::{Error, NodeResultExt, Result};
pub use metrics::{CheckEvent, CountingMetrics, MetricsSink, NoopMetrics};
pub use node::{
    BatchId, BatchRequest, ClusterProvider, NamedNode, NodeError, NodeHandle, NodeRestarter, NodeResult,
    ReserveState,
};
pub use pool::for_each_bounded;
pub use random::{mine_chunk, random_data, Blake3Addressing, ChunkAddressing, DeterministicRandom, MinedChunk};
pub use report::{CheckReport, Failure};
pub use retry::{Backoff, Retry};

/// Run several checks one after another against the same cluster.
///
/// Each check gets a fresh [`CheckContext`] from `config`, so every
/// invocation has its own deadline. Fatal errors stop the sequence;
/// failed reports are collected.
pub async fn run_all(
    checks: &[&dyn Check],
    cluster: &dyn ClusterProvider,
    config: &RunConfig,
) -> Result<Vec<CheckReport>> {
    let mut reports = Vec::with_capacity(checks.len());
    for check in checks {
        let ctx = CheckContext::start(config)?;
        match check.run(cluster, &ctx).await {
            Ok(report) => reports.push(report),
            Err(Error::CheckFailed(report)) => {
                tracing::warn!(check = check.name(), "{report}");
                reports.push(*report);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(reports)
}
