//! Pull-sync: a chunk must reach every node the topology says should hold it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use swarmcheck_dht::{predict, Address, Replica, ADDRESS_LEN};
use tracing::{debug, info, warn};

use super::{require, settle, Check};
use crate::cluster::{capture_snapshot, find_node, sorted_nodes};
use crate::config::CheckContext;
use crate::error::{Error, NodeResultExt, Result};
use crate::metrics::{CheckEvent, MetricsSink, NoopMetrics};
use crate::node::{ClusterProvider, NamedNode};
use crate::pool::for_each_bounded;
use crate::random::{mine_chunk, ChunkAddressing};
use crate::report::{CheckReport, Failure};
use crate::retry::Backoff;

const NAME: &str = "pullsync";

/// Pull-sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullSyncOptions {
    pub upload_node_count: usize,
    pub chunks_per_node: usize,
    pub chunk_size: usize,
    /// Proximity to the uploader of the first mined chunk.
    pub start_po: usize,
    /// Increase of the target proximity after a fully synced chunk.
    pub po_step: usize,
    /// The target wraps back to `start_po` once it would pass this.
    pub max_po: usize,
    pub retries: usize,
    pub backoff: Backoff,
}

impl Default for PullSyncOptions {
    fn default() -> Self {
        Self {
            upload_node_count: 1,
            chunks_per_node: 1,
            chunk_size: 4096,
            start_po: 1,
            po_step: 2,
            max_po: 9,
            retries: 10,
            backoff: Backoff::Linear(Duration::from_secs(1)),
        }
    }
}

impl PullSyncOptions {
    pub fn validate(&self) -> Result<()> {
        require(self.upload_node_count > 0, || "upload_node_count must be at least 1".into())?;
        require(self.chunks_per_node > 0, || "chunks_per_node must be at least 1".into())?;
        require(self.chunk_size > 0, || "chunk_size must be positive".into())?;
        require(self.po_step > 0, || "po_step must be positive".into())?;
        require(self.start_po <= self.max_po, || {
            format!("start_po {} is above max_po {}", self.start_po, self.max_po)
        })?;
        require(self.max_po < ADDRESS_LEN * 8, || {
            format!("max_po {} is beyond a {}-bit address", self.max_po, ADDRESS_LEN * 8)
        })?;
        require(self.retries > 0, || "retries must be at least 1".into())
    }

    fn next_po(&self, po: usize) -> usize {
        let next = po + self.po_step;
        if next > self.max_po {
            self.start_po
        } else {
            next
        }
    }
}

/// Uploads chunks at increasing proximity to the uploader and checks every
/// predicted replica ends up holding them.
pub struct PullSyncCheck {
    options: PullSyncOptions,
    addressing: Arc<dyn ChunkAddressing>,
    metrics: Arc<dyn MetricsSink>,
}

impl PullSyncCheck {
    pub fn new(options: PullSyncOptions, addressing: Arc<dyn ChunkAddressing>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            addressing,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn pull_from(
        &self,
        nodes: &[NamedNode],
        uploader: &NamedNode,
        mut rng: StdRng,
        ctx: &CheckContext,
    ) -> Result<CheckReport> {
        let mut report = CheckReport::new(NAME, ctx.seed());
        let overlay = uploader.handle.overlay();
        let mut po = self.options.start_po;

        for _ in 0..self.options.chunks_per_node {
            let mined = ctx
                .within(mine_chunk(
                    &mut rng,
                    self.addressing.as_ref(),
                    &overlay,
                    po,
                    self.options.chunk_size,
                ))
                .await?;

            let uploaded = ctx
                .within(async {
                    uploader
                        .handle
                        .upload_chunk(mined.data.clone(), None)
                        .await
                        .on(&uploader.name)
                })
                .await;
            let chunk = match uploaded {
                Ok(chunk) => chunk,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.fail(Failure::new("upload", e).chunk(&mined.address).node(&uploader.name));
                    continue;
                }
            };
            if chunk != mined.address {
                warn!(expected = %mined.address, assigned = %chunk, "node assigned a different chunk address");
            }
            self.metrics.record(NAME, CheckEvent::Uploaded);

            // The snapshot is taken after the upload; replicas follow the
            // topology the chunk is syncing into.
            let snapshot = match capture_snapshot(nodes, &ctx.snapshot_retry()).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.fail(Failure::new("arrange", format!("topology snapshot: {e}")).chunk(&chunk));
                    continue;
                }
            };
            let replicas = predict(&chunk, &snapshot)?;
            if replicas.is_empty() {
                report.fail(
                    Failure::new("predict", Error::NoDesignatedReplicators { chunk: chunk.clone() }).chunk(&chunk),
                );
                continue;
            }
            debug!(
                chunk = %chunk,
                po,
                closest = %replicas.closest().name,
                replicas = replicas.len(),
                "predicted replicas"
            );

            let mut synced = true;
            for replica in &replicas {
                let node = find_node(nodes, &replica.name)?;
                let outcome = self.await_replica(node, &chunk, ctx).await;
                if outcome.is_ok() {
                    self.metrics.record(NAME, CheckEvent::Synced);
                } else {
                    synced = false;
                    self.metrics.record(NAME, CheckEvent::NotSynced);
                }
                settle(&mut report, outcome, |e| replica_failure(replica, &chunk, e))?;
            }

            if synced {
                po = self.options.next_po(po);
            }
        }

        Ok(report)
    }

    async fn await_replica(&self, node: &NamedNode, chunk: &Address, ctx: &CheckContext) -> Result<()> {
        ctx.retry(self.options.retries, self.options.backoff)
            .until(move |_| async move { node.handle.has_chunk(chunk).await.on(&node.name) })
            .await
            .map(|_| ())
    }
}

fn replica_failure(replica: &Replica, chunk: &Address, error: Error) -> Failure {
    warn!(chunk = %chunk, replica = %replica, error = %error, "chunk not synced to replica");
    Failure::new(
        "await",
        format!(
            "replica (po={}, depth={}, {}) did not sync: {error}",
            replica.proximity, replica.depth, replica.reason
        ),
    )
    .chunk(chunk)
    .node(&replica.name)
}

#[async_trait]
impl Check for PullSyncCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(&self, cluster: &dyn ClusterProvider, ctx: &CheckContext) -> Result<CheckReport> {
        let nodes = ctx.within(sorted_nodes(cluster)).await?;
        if nodes.len() < self.options.upload_node_count {
            return Err(Error::Precondition(format!(
                "{} upload nodes requested, cluster has {}",
                self.options.upload_node_count,
                nodes.len()
            )));
        }
        info!(
            seed = ctx.seed(),
            nodes = nodes.len(),
            uploaders = self.options.upload_node_count,
            start_po = self.options.start_po,
            "running pullsync check"
        );

        let units: Vec<(&NamedNode, StdRng)> = nodes
            .iter()
            .take(self.options.upload_node_count)
            .zip(ctx.streams(self.options.upload_node_count))
            .collect();

        let results = for_each_bounded(units, ctx.concurrency(), |_, (uploader, rng)| {
            self.pull_from(&nodes, uploader, rng, ctx)
        })
        .await;

        let mut report = CheckReport::new(NAME, ctx.seed());
        for result in results {
            report.absorb(result?);
        }
        info!(passed = report.passed, failed = report.failures.len(), "pullsync check finished");
        report.into_result()
    }
}
