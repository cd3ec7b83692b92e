//! Chunk repair: a chunk left only on a stray node comes back through
//! target-hinted retrieval.
//!
//! Roles, chosen per iteration from the live topology:
//!
//! - `B` is the node closest to the chunk.
//! - `A` is connected to `B`.
//! - `C` and `A` are mutually unconnected, and as far apart as possible.
//!
//! The chunk is uploaded to `A`, deleted from every other node, and then
//! requested from `C` with a routing hint towards `A`. Retrieval has to
//! travel the long way round, so a completion faster than the configured
//! floor means it did not take the repair path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use swarmcheck_dht::{farthest_pair, Address, Error as DhtError, ADDRESS_LEN, MIN_REPAIR_NODES};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{require, AtStep, Check, StepError};
use crate::cluster::{capture_snapshot, fetch_peer_lists, find_node, sorted_nodes};
use crate::config::CheckContext;
use crate::error::{Error, NodeResultExt, Result};
use crate::metrics::{CheckEvent, MetricsSink, NoopMetrics};
use crate::node::{ClusterProvider, NamedNode, NodeError};
use crate::random::{mine_chunk, ChunkAddressing, MinedChunk};
use crate::report::{CheckReport, Failure};
use crate::retry::Backoff;

const NAME: &str = "chunkrepair";

/// Chunk repair settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkRepairOptions {
    pub iterations: usize,
    pub chunk_size: usize,
    /// Proximity between the mined chunk and the randomly picked anchor node.
    pub mine_po: usize,
    /// Polls waiting for the closest node to receive the upload.
    pub replication_attempts: usize,
    pub replication_delay: Duration,
    /// The hinted download must not finish faster than this.
    pub min_repair_latency: Duration,
    /// Plain downloads after the repair.
    pub final_download_attempts: usize,
    pub final_download_delay: Duration,
    /// Bytes of the target overlay sent as the routing hint.
    pub hint_prefix_bytes: usize,
}

impl Default for ChunkRepairOptions {
    fn default() -> Self {
        Self {
            iterations: 1,
            chunk_size: 4096,
            mine_po: 1,
            replication_attempts: 10,
            replication_delay: Duration::from_secs(1),
            min_repair_latency: Duration::from_secs(50),
            final_download_attempts: 5,
            final_download_delay: Duration::from_secs(2),
            hint_prefix_bytes: 1,
        }
    }
}

impl ChunkRepairOptions {
    pub fn validate(&self) -> Result<()> {
        require(self.iterations > 0, || "iterations must be at least 1".into())?;
        require(self.chunk_size > 0, || "chunk_size must be positive".into())?;
        require(self.replication_attempts > 0, || "replication_attempts must be at least 1".into())?;
        require(self.final_download_attempts > 0, || {
            "final_download_attempts must be at least 1".into()
        })?;
        require(self.mine_po < ADDRESS_LEN * 8, || {
            format!("mine_po {} is beyond a {}-bit address", self.mine_po, ADDRESS_LEN * 8)
        })?;
        require(self.hint_prefix_bytes > 0, || "hint_prefix_bytes must be positive".into())
    }
}

/// The three nodes of one repair iteration.
struct Roles<'a> {
    uploader: &'a NamedNode,
    closest: &'a NamedNode,
    downloader: &'a NamedNode,
}

/// Deletes a chunk from all but one node and checks hinted retrieval
/// restores it.
pub struct ChunkRepairCheck {
    options: ChunkRepairOptions,
    addressing: Arc<dyn ChunkAddressing>,
    metrics: Arc<dyn MetricsSink>,
}

impl ChunkRepairCheck {
    pub fn new(options: ChunkRepairOptions, addressing: Arc<dyn ChunkAddressing>) -> Result<Self> {
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

    async fn iteration(
        &self,
        nodes: &[NamedNode],
        mut rng: StdRng,
        ctx: &CheckContext,
        report: &mut CheckReport,
    ) -> Result<()> {
        let (mined, roles) = match self.arrange(nodes, &mut rng, ctx).await {
            Ok(arranged) => arranged,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "chunk repair arrange failed");
                report.fail(Failure::new("arrange", e));
                return Ok(());
            }
        };

        match self.repair(nodes, &roles, &mined, ctx).await {
            Ok(latency) => {
                report.pass();
                self.metrics.record(NAME, CheckEvent::Repaired);
                self.metrics.observe(NAME, CheckEvent::Repaired, latency);
                info!(chunk = %mined.address, ?latency, "chunk repaired");
                Ok(())
            }
            Err(e) => {
                warn!(chunk = %mined.address, step = e.step, node = %e.node, error = %e.error, "chunk repair failed");
                e.settle(report, Some(&mined.address))
            }
        }
    }

    /// Mine the chunk and assign the three roles from the live topology.
    async fn arrange<'a>(
        &self,
        nodes: &'a [NamedNode],
        rng: &mut StdRng,
        ctx: &CheckContext,
    ) -> Result<(MinedChunk, Roles<'a>)> {
        let snapshot = capture_snapshot(nodes, &ctx.snapshot_retry()).await?;
        let anchor = &nodes[rng.gen_range(0..nodes.len())];
        let anchor_overlay = anchor.handle.overlay();
        let mined = ctx
            .within(mine_chunk(
                rng,
                self.addressing.as_ref(),
                &anchor_overlay,
                self.options.mine_po,
                self.options.chunk_size,
            ))
            .await?;

        let (closest_name, closest_topology) = snapshot.closest(&mined.address)?;
        let closest = find_node(nodes, closest_name)?;
        let overlays: Vec<Address> = nodes.iter().map(|node| node.handle.overlay()).collect();
        let peer_lists = ctx.within(fetch_peer_lists(nodes)).await?;
        let (a, c) = farthest_pair(&closest_topology.overlay, &overlays, &peer_lists)?;
        let roles = Roles {
            uploader: node_with_overlay(nodes, &a)?,
            closest,
            downloader: node_with_overlay(nodes, &c)?,
        };
        info!(
            chunk = %mined.address,
            uploader = %roles.uploader.name,
            closest = %roles.closest.name,
            downloader = %roles.downloader.name,
            "chunk repair roles"
        );
        Ok((mined, roles))
    }

    /// Act, await and assert for one iteration. Returns the hinted
    /// download's latency.
    async fn repair(
        &self,
        nodes: &[NamedNode],
        roles: &Roles<'_>,
        mined: &MinedChunk,
        ctx: &CheckContext,
    ) -> std::result::Result<Duration, StepError> {
        let Roles {
            uploader,
            closest,
            downloader,
        } = *roles;
        let chunk = &mined.address;

        let uploaded = ctx
            .within(async {
                uploader
                    .handle
                    .upload_chunk(mined.data.clone(), None)
                    .await
                    .on(&uploader.name)
            })
            .await
            .at("upload", uploader)?;
        if &uploaded != chunk {
            return Err(StepError::new(
                "upload",
                uploader,
                Error::Precondition(format!("node assigned {uploaded}, expected {chunk}")),
            ));
        }
        self.metrics.record(NAME, CheckEvent::Uploaded);

        ctx.retry(
            self.options.replication_attempts,
            Backoff::Fixed(self.options.replication_delay),
        )
        .until(move |_| async move { closest.handle.has_chunk(chunk).await.on(&closest.name) })
        .await
        .at("replicate", closest)?;
        debug!(chunk = %chunk, closest = %closest.name, "chunk reached closest node");

        let data = self.download(downloader, chunk, None, ctx).await.at("download", downloader)?;
        verify(mined, &data, downloader).at("download", downloader)?;

        for node in nodes.iter().filter(|node| node.name != uploader.name) {
            let removed = ctx
                .within(async { node.handle.remove_chunk(chunk).await.on(&node.name) })
                .await;
            match removed {
                Ok(())
                | Err(Error::Node {
                    source: NodeError::NotFound(_),
                    ..
                }) => {}
                Err(e) => return Err(StepError::new("delete", node, e)),
            }
        }
        debug!(chunk = %chunk, keeper = %uploader.name, "chunk deleted from all other nodes");

        let hint = uploader.handle.overlay().prefix_hex(self.options.hint_prefix_bytes);
        let started = Instant::now();
        let recovered = self
            .download(downloader, chunk, Some(&hint), ctx)
            .await
            .map_err(|e| match e {
                Error::DeadlineExceeded => e,
                e => Error::RecoveryFailed {
                    chunk: chunk.clone(),
                    reason: e.to_string(),
                },
            })
            .at("recover", downloader)?;
        let latency = started.elapsed();
        verify(mined, &recovered, downloader).at("recover", downloader)?;
        if latency < self.options.min_repair_latency {
            let reason = format!(
                "completed in {latency:?}, below the {:?} repair latency floor",
                self.options.min_repair_latency
            );
            return Err(StepError::new(
                "recover",
                downloader,
                Error::RecoveryFailed {
                    chunk: chunk.clone(),
                    reason,
                },
            ));
        }

        ctx.retry(
            self.options.final_download_attempts,
            Backoff::Fixed(self.options.final_download_delay),
        )
        .until(move |_| async move {
            let data = downloader
                .handle
                .download_chunk(chunk, None)
                .await
                .on(&downloader.name)?;
            Ok(data == mined.data)
        })
        .await
        .at("redownload", downloader)?;

        Ok(latency)
    }

    async fn download(
        &self,
        node: &NamedNode,
        chunk: &Address,
        hint: Option<&str>,
        ctx: &CheckContext,
    ) -> Result<Bytes> {
        let data = ctx
            .within(async { node.handle.download_chunk(chunk, hint).await.on(&node.name) })
            .await?;
        self.metrics.record(NAME, CheckEvent::Downloaded);
        Ok(data)
    }
}

fn node_with_overlay<'a>(nodes: &'a [NamedNode], overlay: &Address) -> Result<&'a NamedNode> {
    nodes
        .iter()
        .find(|node| &node.handle.overlay() == overlay)
        .ok_or_else(|| Error::Precondition(format!("no node with overlay {overlay}")))
}

fn verify(mined: &MinedChunk, data: &Bytes, node: &NamedNode) -> Result<()> {
    if data == &mined.data {
        Ok(())
    } else {
        Err(Error::DataMismatch {
            chunk: mined.address.clone(),
            node: node.name.clone(),
        })
    }
}

#[async_trait]
impl Check for ChunkRepairCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(&self, cluster: &dyn ClusterProvider, ctx: &CheckContext) -> Result<CheckReport> {
        let nodes = ctx.within(sorted_nodes(cluster)).await?;
        if nodes.len() < MIN_REPAIR_NODES {
            return Err(DhtError::InsufficientTopology {
                known: nodes.len(),
                needed: MIN_REPAIR_NODES,
            }
            .into());
        }
        info!(
            seed = ctx.seed(),
            nodes = nodes.len(),
            iterations = self.options.iterations,
            "running chunk repair check"
        );

        // Iterations run one after another: each deletes chunks cluster-wide
        // and measures latency.
        let mut report = CheckReport::new(NAME, ctx.seed());
        for rng in ctx.streams(self.options.iterations) {
            self.iteration(&nodes, rng, ctx, &mut report).await?;
        }
        info!(passed = report.passed, failed = report.failures.len(), "chunk repair check finished");
        report.into_result()
    }
}
