//! Push-sync: an uploaded chunk must land on the node closest to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use swarmcheck_dht::{Address, TopologySnapshot};
use tracing::{debug, info, warn};

use super::{require, settle, Check};
use crate::cluster::{capture_snapshot, find_node, sorted_nodes};
use crate::config::CheckContext;
use crate::error::{Error, NodeResultExt, Result};
use crate::metrics::{CheckEvent, MetricsSink, NoopMetrics};
use crate::node::{ClusterProvider, NamedNode, NodeRestarter};
use crate::pool::for_each_bounded;
use crate::random::random_data;
use crate::report::{CheckReport, Failure};
use crate::retry::Backoff;

const NAME: &str = "pushsync";

/// Push-sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSyncOptions {
    /// Upload from the first N nodes, by name.
    pub upload_node_count: usize,
    pub chunks_per_node: usize,
    pub chunk_size: usize,
    /// `has_chunk` polls against the closest node.
    pub retries: usize,
    pub retry_delay: Duration,
}

impl Default for PushSyncOptions {
    fn default() -> Self {
        Self {
            upload_node_count: 1,
            chunks_per_node: 1,
            chunk_size: 4096,
            retries: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PushSyncOptions {
    pub fn validate(&self) -> Result<()> {
        require(self.upload_node_count > 0, || "upload_node_count must be at least 1".into())?;
        require(self.chunks_per_node > 0, || "chunks_per_node must be at least 1".into())?;
        require(self.chunk_size > 0, || "chunk_size must be positive".into())?;
        require(self.retries > 0, || "retries must be at least 1".into())
    }
}

/// Uploads random chunks and checks each reaches its closest node.
///
/// With a [`NodeRestarter`] attached, the closest node is stopped and
/// started again before polling, so the check also covers persistence.
pub struct PushSyncCheck {
    options: PushSyncOptions,
    metrics: Arc<dyn MetricsSink>,
    restarter: Option<Arc<dyn NodeRestarter>>,
}

impl PushSyncCheck {
    pub fn new(options: PushSyncOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            metrics: Arc::new(NoopMetrics),
            restarter: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn NodeRestarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    async fn push_from(
        &self,
        nodes: &[NamedNode],
        uploader: &NamedNode,
        mut rng: StdRng,
        ctx: &CheckContext,
    ) -> Result<CheckReport> {
        let mut report = CheckReport::new(NAME, ctx.seed());

        let snapshot = match capture_snapshot(nodes, &ctx.snapshot_retry()).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                report.fail(Failure::new("arrange", format!("topology snapshot: {e}")).node(&uploader.name));
                return Ok(report);
            }
        };

        for _ in 0..self.options.chunks_per_node {
            let data = random_data(&mut rng, self.options.chunk_size);
            let uploaded = ctx
                .within(async { uploader.handle.upload_chunk(data, None).await.on(&uploader.name) })
                .await;

            let chunk = match uploaded {
                Ok(chunk) => chunk,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.fail(Failure::new("upload", e).node(&uploader.name));
                    continue;
                }
            };
            self.metrics.record(NAME, CheckEvent::Uploaded);
            debug!(chunk = %chunk, uploader = %uploader.name, "uploaded chunk");

            let closest = closest_node(nodes, &snapshot, &chunk)?;
            let outcome = self.await_closest(closest, &chunk, ctx).await;
            if outcome.is_ok() {
                self.metrics.record(NAME, CheckEvent::Synced);
            } else {
                self.metrics.record(NAME, CheckEvent::NotSynced);
            }
            settle(&mut report, outcome, |e| {
                warn!(chunk = %chunk, closest = %closest.name, error = %e, "chunk not found on closest node");
                Failure::new("await", format!("closest node did not store the chunk: {e}"))
                    .chunk(&chunk)
                    .node(&closest.name)
            })?;
        }

        Ok(report)
    }

    async fn await_closest(&self, closest: &NamedNode, chunk: &Address, ctx: &CheckContext) -> Result<()> {
        if let Some(restarter) = &self.restarter {
            info!(node = %closest.name, "restarting closest node");
            let stopped = ctx
                .within(async { restarter.stop(&closest.name).await.on(&closest.name) })
                .await;
            // A failed stop may still have taken the node down.
            let started = ctx
                .retry(self.options.retries, Backoff::Fixed(self.options.retry_delay))
                .poll(move |_| async move { restarter.start(&closest.name).await.on(&closest.name).map(Some) })
                .await;
            if let Err(e) = &started {
                warn!(node = %closest.name, error = %e, "node may be left stopped");
            }
            stopped?;
            started?;
        }

        let attempt = ctx
            .retry(self.options.retries, Backoff::Fixed(self.options.retry_delay))
            .until(move |_| async move { closest.handle.has_chunk(chunk).await.on(&closest.name) })
            .await?;
        debug!(chunk = %chunk, closest = %closest.name, attempt, "chunk synced to closest node");
        Ok(())
    }
}

fn closest_node<'a>(nodes: &'a [NamedNode], snapshot: &TopologySnapshot, chunk: &Address) -> Result<&'a NamedNode> {
    let (name, _) = snapshot.closest(chunk)?;
    find_node(nodes, name)
}

#[async_trait]
impl Check for PushSyncCheck {
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
            chunks_per_node = self.options.chunks_per_node,
            "running pushsync check"
        );

        let units: Vec<(&NamedNode, StdRng)> = nodes
            .iter()
            .take(self.options.upload_node_count)
            .zip(ctx.streams(self.options.upload_node_count))
            .collect();

        let results = for_each_bounded(units, ctx.concurrency(), |_, (uploader, rng)| {
            self.push_from(&nodes, uploader, rng, ctx)
        })
        .await;

        let mut report = CheckReport::new(NAME, ctx.seed());
        for result in results {
            report.absorb(result?);
        }
        info!(passed = report.passed, failed = report.failures.len(), "pushsync check finished");
        report.into_result()
    }
}
