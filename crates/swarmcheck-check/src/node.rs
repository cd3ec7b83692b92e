//! Collaborator contracts for the cluster under test.
//!
//! Checks never talk HTTP or Kubernetes themselves. They drive nodes through
//! [`NodeHandle`], enumerate them through [`ClusterProvider`] and, for the
//! dynamic variants, stop and start them through [`NodeRestarter`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use swarmcheck_dht::{Address, NodeTopology};
use thiserror::Error;

/// Result type for collaborator calls.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Failures reported by a node's API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Connection refused, reset, or the node is down.
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The requested chunk or resource does not exist on the node.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other API failure.
    #[error("api error: {0}")]
    Api(String),
}

/// Identifier of a postage batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub [u8; 32]);

impl BatchId {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// Parameters of a postage batch purchase.
///
/// Higher `amount` means higher storage value: chunks stamped with it are
/// evicted after chunks stamped with a cheaper batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub amount: u64,
    pub depth: u8,
    pub label: String,
}

impl BatchRequest {
    pub fn new(amount: u64, depth: u8, label: impl Into<String>) -> Self {
        Self {
            amount,
            depth,
            label: label.into(),
        }
    }
}

/// Reserve occupancy as reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveState {
    /// Radius derived from batch commitment.
    pub radius: usize,
    /// Free reserve capacity, in chunks.
    pub available: i64,
    /// Radius the node actually stores at.
    pub storage_radius: usize,
}

/// API of one running node.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// The node's overlay address.
    fn overlay(&self) -> Address;

    /// Current depth and bins.
    async fn topology(&self) -> NodeResult<NodeTopology>;

    /// Upload a chunk, optionally stamped with a batch; returns its address.
    async fn upload_chunk(&self, data: Bytes, batch: Option<&BatchId>) -> NodeResult<Address>;

    /// Whether the chunk is in the node's local store.
    async fn has_chunk(&self, chunk: &Address) -> NodeResult<bool>;

    /// Retrieve a chunk through the network. `routing_hint` names a target
    /// address prefix (hex) that retrieval should route through.
    async fn download_chunk(&self, chunk: &Address, routing_hint: Option<&str>) -> NodeResult<Bytes>;

    /// Delete a chunk from the node's local store.
    async fn remove_chunk(&self, chunk: &Address) -> NodeResult<()>;

    /// Overlays of connected peers.
    async fn peers(&self) -> NodeResult<Vec<Address>>;

    async fn pin_chunk(&self, chunk: &Address) -> NodeResult<()>;

    async fn unpin_chunk(&self, chunk: &Address) -> NodeResult<()>;

    /// Currently pinned chunk addresses.
    async fn pins(&self) -> NodeResult<Vec<Address>>;

    /// Buy a batch, or return an existing usable one with the same label.
    async fn create_or_fetch_batch(&self, request: &BatchRequest) -> NodeResult<BatchId>;

    async fn reserve_state(&self) -> NodeResult<ReserveState>;
}

/// A live node paired with its human-readable name.
#[derive(Clone)]
pub struct NamedNode {
    pub name: String,
    pub handle: Arc<dyn NodeHandle>,
}

impl NamedNode {
    pub fn new(name: impl Into<String>, handle: Arc<dyn NodeHandle>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

impl std::fmt::Debug for NamedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedNode")
            .field("name", &self.name)
            .field("overlay", &self.handle.overlay().to_string())
            .finish()
    }
}

/// Enumerates the live nodes of a cluster.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// All live nodes. Order is not significant; callers sort by name.
    async fn nodes(&self) -> NodeResult<Vec<NamedNode>>;
}

/// Stops and starts nodes for the dynamic check variants.
#[async_trait]
pub trait NodeRestarter: Send + Sync {
    async fn stop(&self, node: &str) -> NodeResult<()>;

    async fn start(&self, node: &str) -> NodeResult<()>;
}
