//! Reserve eviction: chunks outside the storage radius give way to chunks
//! inside it, cheap chunks before valuable ones, pinned chunks never.
//!
//! Against one node with radius `r`:
//!
//! 1. Pin one chunk at proximity `r - 1`, where unpinned chunks get evicted.
//! 2. Upload a first wave at `r - 1` with the cheap batch. It fills the cache.
//! 3. Upload a second wave at `r`. The first wave is pushed into the cache
//!    and a share of it evicted.
//! 4. Upload a wave at `r` with the valuable batch. None of it is evicted.
//! 5. The pinned chunk survived; unpinning is idempotent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use swarmcheck_dht::Address;
use tracing::{debug, info, warn};

use super::{require, AtStep, Check, StepError};
use crate::cluster::{find_node, sorted_nodes};
use crate::config::CheckContext;
use crate::error::{Error, NodeResultExt, Result};
use crate::metrics::{CheckEvent, MetricsSink, NoopMetrics};
use crate::node::{BatchId, BatchRequest, ClusterProvider, NamedNode};
use crate::random::{mine_chunk, ChunkAddressing};
use crate::report::{CheckReport, Failure};
use crate::retry::Backoff;

const NAME: &str = "reserve";

/// Reserve eviction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveOptions {
    /// Node under test. Defaults to the first node by name.
    pub node: Option<String>,
    pub chunk_size: usize,
    pub low_value_batch: BatchRequest,
    pub high_value_batch: BatchRequest,
    /// First-wave size: enough chunks to fill the node's cache.
    pub cache_capacity: usize,
    /// First-wave chunks expected to survive the second wave.
    pub expected_survivors: usize,
    pub second_wave: usize,
    pub high_value_wave: usize,
    /// Polls for a wave's count to settle.
    pub settle_attempts: usize,
    pub settle_delay: Duration,
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self {
            node: None,
            chunk_size: 4096,
            low_value_batch: BatchRequest::new(1, 22, "reserve-low-value"),
            high_value_batch: BatchRequest::new(2, 22, "reserve-high-value"),
            cache_capacity: 10,
            expected_survivors: 9,
            second_wave: 10,
            high_value_wave: 5,
            settle_attempts: 10,
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl ReserveOptions {
    pub fn validate(&self) -> Result<()> {
        require(self.chunk_size > 0, || "chunk_size must be positive".into())?;
        require(self.cache_capacity > 0, || "cache_capacity must be at least 1".into())?;
        require(self.expected_survivors <= self.cache_capacity, || {
            format!(
                "expected_survivors {} exceeds cache_capacity {}",
                self.expected_survivors, self.cache_capacity
            )
        })?;
        require(self.second_wave > 0, || "second_wave must be at least 1".into())?;
        require(self.high_value_wave > 0, || "high_value_wave must be at least 1".into())?;
        require(self.settle_attempts > 0, || "settle_attempts must be at least 1".into())?;
        require(self.low_value_batch.amount < self.high_value_batch.amount, || {
            "high_value_batch must be worth more than low_value_batch".into()
        })
    }
}

/// Checks eviction order of one node's reserve.
pub struct ReserveCheck {
    options: ReserveOptions,
    addressing: Arc<dyn ChunkAddressing>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReserveCheck {
    pub fn new(options: ReserveOptions, addressing: Arc<dyn ChunkAddressing>) -> Result<Self> {
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

    fn target<'a>(&self, nodes: &'a [NamedNode]) -> Result<&'a NamedNode> {
        match &self.options.node {
            Some(name) => find_node(nodes, name),
            None => nodes
                .first()
                .ok_or_else(|| Error::Precondition("cluster has no nodes".into())),
        }
    }

    /// Mine and upload `count` chunks at proximity `po` to the node.
    async fn upload_wave(
        &self,
        node: &NamedNode,
        rng: &mut StdRng,
        po: usize,
        count: usize,
        batch: &BatchId,
        ctx: &CheckContext,
    ) -> Result<Vec<Address>> {
        let overlay = node.handle.overlay();
        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            let mined = ctx
                .within(mine_chunk(rng, self.addressing.as_ref(), &overlay, po, self.options.chunk_size))
                .await?;
            let chunk = ctx
                .within(async { node.handle.upload_chunk(mined.data, Some(batch)).await.on(&node.name) })
                .await?;
            self.metrics.record(NAME, CheckEvent::Uploaded);
            chunks.push(chunk);
        }
        debug!(node = %node.name, po, count, "uploaded wave");
        Ok(chunks)
    }

    /// Poll until exactly `expected` of `chunks` are on the node.
    ///
    /// Records one assertion, and returns the count last observed.
    async fn assert_count(
        &self,
        node: &NamedNode,
        wave: &'static str,
        chunks: &[Address],
        expected: usize,
        ctx: &CheckContext,
        report: &mut CheckReport,
    ) -> Result<usize> {
        let observed = AtomicUsize::new(0);
        let seen = &observed;
        let outcome = ctx
            .retry(self.options.settle_attempts, Backoff::Fixed(self.options.settle_delay))
            .until(move |_| async move {
                let count = count_present(node, chunks).await?;
                seen.store(count, Ordering::Relaxed);
                Ok(count == expected)
            })
            .await;
        let observed = observed.load(Ordering::Relaxed);

        match outcome {
            Ok(_) => {
                report.pass();
                debug!(node = %node.name, wave, observed, "wave count settled");
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(node = %node.name, wave, expected, observed, error = %e, "wave count did not settle");
                report.fail(
                    Failure::new(
                        "assert",
                        format!("{wave}: expected {expected} of {} chunks, found {observed}", chunks.len()),
                    )
                    .node(&node.name),
                );
            }
        }
        Ok(observed)
    }

    /// Upload one chunk at proximity `po` and pin it.
    async fn pin_one(
        &self,
        node: &NamedNode,
        rng: &mut StdRng,
        po: usize,
        batch: &BatchId,
        ctx: &CheckContext,
    ) -> Result<Address> {
        let overlay = node.handle.overlay();
        let mined = ctx
            .within(mine_chunk(rng, self.addressing.as_ref(), &overlay, po, self.options.chunk_size))
            .await?;
        let chunk = ctx
            .within(async { node.handle.upload_chunk(mined.data, Some(batch)).await.on(&node.name) })
            .await?;
        ctx.within(async { node.handle.pin_chunk(&chunk).await.on(&node.name) })
            .await?;
        debug!(node = %node.name, chunk = %chunk, po, "pinned chunk");
        Ok(chunk)
    }

    async fn batch(&self, node: &NamedNode, request: &BatchRequest, ctx: &CheckContext) -> Result<BatchId> {
        ctx.within(async { node.handle.create_or_fetch_batch(request).await.on(&node.name) })
            .await
    }

    async fn pins(&self, node: &NamedNode, ctx: &CheckContext) -> Result<Vec<Address>> {
        ctx.within(async { node.handle.pins().await.on(&node.name) }).await
    }

    async fn unpin(&self, node: &NamedNode, chunk: &Address, ctx: &CheckContext) -> Result<()> {
        ctx.within(async { node.handle.unpin_chunk(chunk).await.on(&node.name) })
            .await
    }

    /// Five assertions: the pinned chunk survived, it is the only pin, and
    /// unpinning clears it and can be repeated.
    async fn assert_pins(
        &self,
        node: &NamedNode,
        pinned: &Address,
        ctx: &CheckContext,
        report: &mut CheckReport,
    ) -> Result<()> {
        let present = ctx
            .within(async { node.handle.has_chunk(pinned).await.on(&node.name) })
            .await;
        let outcome = present.map(|held| (!held).then(|| "pinned chunk was evicted".to_string()));
        record_pin(report, node, pinned, "presence", outcome)?;

        let outcome = self.pins(node, ctx).await.map(|pins| {
            (pins != [pinned.clone()]).then(|| format!("expected exactly the pinned chunk, found {} pins", pins.len()))
        });
        record_pin(report, node, pinned, "pin list", outcome)?;

        let cleared = async {
            self.unpin(node, pinned, ctx).await?;
            let pins = self.pins(node, ctx).await?;
            Ok::<_, Error>((!pins.is_empty()).then(|| format!("{} pins left after unpinning", pins.len())))
        }
        .await;
        record_pin(report, node, pinned, "unpin", cleared)?;

        let again = self.unpin(node, pinned, ctx).await.map(|()| None);
        record_pin(report, node, pinned, "unpinning twice", again)?;

        let outcome = self.pins(node, ctx).await.map(|pins| {
            (!pins.is_empty()).then(|| format!("{} pins after unpinning twice", pins.len()))
        });
        record_pin(report, node, pinned, "pin list after unpinning twice", outcome)
    }

    /// Everything after target selection. Non-fatal errors abort the
    /// remaining steps but keep the assertions recorded so far.
    async fn exercise(
        &self,
        node: &NamedNode,
        rng: &mut StdRng,
        ctx: &CheckContext,
        report: &mut CheckReport,
    ) -> std::result::Result<(), StepError> {
        let state = ctx
            .within(async { node.handle.reserve_state().await.on(&node.name) })
            .await
            .at("arrange", node)?;
        let radius = state.radius;
        if radius == 0 {
            let reason = format!("node {} has reserve radius 0, nothing lies outside it", node.name);
            return Err(StepError::new("arrange", node, Error::Precondition(reason)));
        }
        info!(seed = ctx.seed(), node = %node.name, radius, available = state.available, "running reserve check");

        let low = self
            .batch(node, &self.options.low_value_batch, ctx)
            .await
            .at("arrange", node)?;
        let pinned = self
            .pin_one(node, rng, radius - 1, &low, ctx)
            .await
            .at("arrange", node)?;

        let first = self
            .upload_wave(node, rng, radius - 1, self.options.cache_capacity, &low, ctx)
            .await
            .at("upload", node)?;
        let second = self
            .upload_wave(node, rng, radius, self.options.second_wave, &low, ctx)
            .await
            .at("upload", node)?;

        let survivors = self
            .assert_count(node, "first wave", &first, self.options.expected_survivors, ctx, report)
            .await
            .at("assert", node)?;
        for _ in survivors..first.len() {
            self.metrics.record(NAME, CheckEvent::Evicted);
        }
        self.assert_count(node, "second wave", &second, second.len(), ctx, report)
            .await
            .at("assert", node)?;

        let high = self
            .batch(node, &self.options.high_value_batch, ctx)
            .await
            .at("upload", node)?;
        let valuable = self
            .upload_wave(node, rng, radius, self.options.high_value_wave, &high, ctx)
            .await
            .at("upload", node)?;
        self.assert_count(node, "high-value wave", &valuable, valuable.len(), ctx, report)
            .await
            .at("assert", node)?;

        self.assert_pins(node, &pinned, ctx, report).await.at("pin", node)
    }
}

/// Record one pin assertion. `Ok(Some(reason))` is a failed assertion.
fn record_pin(
    report: &mut CheckReport,
    node: &NamedNode,
    pinned: &Address,
    what: &str,
    outcome: Result<Option<String>>,
) -> Result<()> {
    let reason = match outcome {
        Ok(None) => {
            report.pass();
            return Ok(());
        }
        Ok(Some(reason)) => reason,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => format!("{what}: {e}"),
    };
    report.fail(Failure::new("pin", reason).chunk(pinned).node(&node.name));
    Ok(())
}

async fn count_present(node: &NamedNode, chunks: &[Address]) -> Result<usize> {
    let present = try_join_all(chunks.iter().map(|chunk| async move {
        node.handle.has_chunk(chunk).await.on(&node.name)
    }))
    .await?;
    Ok(present.into_iter().filter(|held| *held).count())
}

#[async_trait]
impl Check for ReserveCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn run(&self, cluster: &dyn ClusterProvider, ctx: &CheckContext) -> Result<CheckReport> {
        let nodes = ctx.within(sorted_nodes(cluster)).await?;
        let node = self.target(&nodes)?;
        let mut rng = ctx
            .streams(1)
            .pop()
            .ok_or_else(|| Error::Precondition("no random stream".into()))?;

        let mut report = CheckReport::new(NAME, ctx.seed());
        if let Err(e) = self.exercise(node, &mut rng, ctx, &mut report).await {
            warn!(node = %e.node, step = e.step, error = %e.error, "reserve check stopped early");
            e.settle(&mut report, None)?;
        }

        info!(passed = report.passed, failed = report.failures.len(), "reserve check finished");
        report.into_result()
    }
}
