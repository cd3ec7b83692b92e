//! In-memory cluster used by the check tests.
//!
//! Nodes store what replica prediction says they should, so a healthy
//! simulated cluster passes every check. Faults are injected per node.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use swarmcheck_dht::{predict, proximity, Address, NodeTopology, TopologySnapshot, ADDRESS_LEN};

use crate::node::{
    BatchId, BatchRequest, ClusterProvider, NamedNode, NodeError, NodeHandle, NodeRestarter, NodeResult,
    ReserveState,
};
use crate::random::{Blake3Addressing, ChunkAddressing};

/// Reserve behaviour of one node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimReserve {
    pub radius: usize,
    pub cache_capacity: usize,
    /// Share of the cache dropped once it fills up. Zero disables eviction.
    pub evict_percent: usize,
    /// When false, pinned chunks are demoted and evicted like any other.
    pub honours_pins: bool,
}

impl Default for SimReserve {
    fn default() -> Self {
        Self {
            radius: 2,
            cache_capacity: 10,
            evict_percent: 10,
            honours_pins: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Hang,
    Fail,
}

struct Stored {
    data: Bytes,
    po: usize,
    value: u64,
    seq: u64,
}

struct SimNode {
    overlay: Address,
    depth: usize,
    disconnected: BTreeSet<Address>,
    store: HashMap<Address, Stored>,
    cache: VecDeque<Address>,
    pins: BTreeSet<Address>,
    online: bool,
    refuses: bool,
    probe_failures: usize,
    /// Peer list requests answered before the node starts failing them.
    peer_answers: Option<usize>,
    /// Operations that never return, or fail outright.
    faults: BTreeMap<&'static str, Fault>,
    reserve: Option<SimReserve>,
}

impl SimNode {
    fn new(overlay: Address, depth: usize) -> Self {
        Self {
            overlay,
            depth,
            disconnected: BTreeSet::new(),
            store: HashMap::new(),
            cache: VecDeque::new(),
            pins: BTreeSet::new(),
            online: true,
            refuses: false,
            probe_failures: 0,
            peer_answers: None,
            faults: BTreeMap::new(),
            reserve: None,
        }
    }

    fn put(&mut self, chunk: &Address, data: Bytes, value: u64, seq: u64) {
        if self.refuses {
            return;
        }
        let po = proximity(chunk, &self.overlay);
        self.store.insert(chunk.clone(), Stored { data, po, value, seq });

        let Some(reserve) = self.reserve else {
            return;
        };
        if po < reserve.radius {
            return;
        }

        // A chunk at the radius pushes lower-order chunks out of the reserve.
        let mut demoted: Vec<(&Address, &Stored)> = self
            .store
            .iter()
            .filter(|(addr, stored)| {
                let pinned = reserve.honours_pins && self.pins.contains(*addr);
                stored.po < reserve.radius && !pinned && !self.cache.contains(*addr)
            })
            .collect();
        demoted.sort_by_key(|(_, stored)| stored.seq);
        let demoted: Vec<Address> = demoted.into_iter().map(|(addr, _)| addr.clone()).collect();
        self.cache.extend(demoted);

        if reserve.evict_percent > 0 && self.cache.len() >= reserve.cache_capacity {
            let evict = (self.cache.len() * reserve.evict_percent / 100).max(1);
            let mut order: Vec<Address> = self.cache.iter().cloned().collect();
            order.sort_by_key(|addr| self.store.get(addr).map(|s| (s.value, s.seq)));
            for addr in order.into_iter().take(evict) {
                self.store.remove(&addr);
                self.cache.retain(|cached| cached != &addr);
            }
        }
    }
}

struct SimState {
    nodes: BTreeMap<String, SimNode>,
    batches: HashMap<String, (BatchId, u64)>,
    repair_delay: Duration,
    uploads: Vec<Address>,
    restarts: usize,
    start_failures: usize,
    repairs: usize,
    seq: u64,
}

impl SimState {
    fn node(&self, name: &str) -> NodeResult<&SimNode> {
        match self.nodes.get(name) {
            Some(node) if node.online => Ok(node),
            Some(_) => Err(NodeError::Unavailable(format!("{name} is stopped"))),
            None => Err(NodeError::Unavailable(format!("{name} does not exist"))),
        }
    }

    fn node_mut(&mut self, name: &str) -> NodeResult<&mut SimNode> {
        match self.nodes.get_mut(name) {
            Some(node) if node.online => Ok(node),
            Some(_) => Err(NodeError::Unavailable(format!("{name} is stopped"))),
            None => Err(NodeError::Unavailable(format!("{name} does not exist"))),
        }
    }

    fn peers_of(&self, name: &str) -> Vec<Address> {
        let Some(node) = self.nodes.get(name) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|(other, peer)| {
                other.as_str() != name
                    && !node.disconnected.contains(&peer.overlay)
                    && !peer.disconnected.contains(&node.overlay)
            })
            .map(|(_, peer)| peer.overlay.clone())
            .collect()
    }

    fn topology_of(&self, name: &str) -> Option<NodeTopology> {
        let node = self.nodes.get(name)?;
        let peers = self.peers_of(name);
        Some(NodeTopology::with_peers(node.overlay.clone(), node.depth, &peers))
    }

    fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot::new(
            self.nodes
                .keys()
                .filter_map(|name| self.topology_of(name).map(|t| (name.clone(), t))),
        )
    }

    fn replicas(&self, chunk: &Address) -> Vec<String> {
        predict(chunk, &self.snapshot())
            .map(|set| set.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Nodes retrieval routes to without a hint: the closest node and
    /// every node holding the chunk within its depth.
    fn neighbourhood(&self, chunk: &Address) -> Vec<String> {
        let snapshot = self.snapshot();
        let closest = snapshot.closest(chunk).map(|(name, _)| name.to_string()).ok();
        self.nodes
            .iter()
            .filter(|(name, node)| {
                closest.as_deref() == Some(name.as_str()) || proximity(chunk, &node.overlay) >= node.depth
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn store_on(&mut self, names: &[String], chunk: &Address, data: &Bytes, value: u64) {
        for name in names {
            self.seq += 1;
            let seq = self.seq;
            if let Some(node) = self.nodes.get_mut(name) {
                if node.online {
                    node.put(chunk, data.clone(), value, seq);
                }
            }
        }
    }

    fn held_by(&self, name: &str, chunk: &Address) -> Option<Bytes> {
        let node = self.nodes.get(name)?;
        if !node.online {
            return None;
        }
        node.store.get(chunk).map(|stored| stored.data.clone())
    }
}

/// A simulated cluster. Cloning shares the same state.
#[derive(Clone)]
pub(crate) struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn new(nodes: Vec<(String, Address, usize)>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(name, overlay, depth)| (name, SimNode::new(overlay, depth)))
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                nodes,
                batches: HashMap::new(),
                repair_delay: Duration::from_secs(60),
                uploads: Vec::new(),
                restarts: 0,
                start_failures: 0,
                repairs: 0,
                seq: 0,
            })),
        }
    }

    /// `count` nodes `bee-0..` spread evenly over the first address byte.
    pub fn uniform(count: usize, depth: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| {
                    let mut bytes = [0u8; ADDRESS_LEN];
                    bytes[0] = (i * 256 / count) as u8;
                    (format!("bee-{i}"), Address::from(bytes), depth)
                })
                .collect(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    fn with_node(&self, name: &str, f: impl FnOnce(&mut SimNode)) {
        let mut state = self.lock();
        let node = state.nodes.get_mut(name).unwrap();
        f(node);
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    pub fn overlay(&self, name: &str) -> Address {
        self.lock().nodes[name].overlay.clone()
    }

    pub fn address_of(&self, data: &[u8]) -> Address {
        Blake3Addressing.address(data)
    }

    pub fn closest_name(&self, chunk: &Address) -> String {
        let state = self.lock();
        let snapshot = state.snapshot();
        let (name, _) = snapshot.closest(chunk).unwrap();
        name.to_string()
    }

    pub fn predicted(&self, chunk: &Address) -> Vec<String> {
        self.lock().replicas(chunk)
    }

    /// Names of the nodes currently storing `chunk`.
    pub fn holders(&self, chunk: &Address) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| node.store.contains_key(chunk))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The node accepts uploads and sync but never stores anything.
    pub fn refuse_chunks(&self, name: &str) {
        self.with_node(name, |node| node.refuses = true);
    }

    /// Fail the node's next `count` `has_chunk` calls with a timeout.
    pub fn fail_next_probes(&self, name: &str, count: usize) {
        self.with_node(name, |node| node.probe_failures = count);
    }

    /// Answer `count` peer list requests, then fail every later one.
    pub fn break_peers_after(&self, name: &str, count: usize) {
        self.with_node(name, |node| node.peer_answers = Some(count));
    }

    /// Inject a fault into `op` (`"remove"`, `"peers"`, `"pins"`, ...) on the node.
    pub fn inject(&self, name: &str, op: &'static str, fault: Fault) {
        self.with_node(name, |node| {
            node.faults.insert(op, fault);
        });
    }

    /// Fail the next `count` restarter `start` calls with a timeout.
    pub fn fail_next_starts(&self, count: usize) {
        self.lock().start_failures = count;
    }

    pub fn set_online(&self, name: &str, online: bool) {
        self.with_node(name, |node| node.online = online);
    }

    pub fn disconnect(&self, a: &str, b: &str) {
        let b_overlay = self.overlay(b);
        self.with_node(a, |node| {
            node.disconnected.insert(b_overlay);
        });
    }

    pub fn set_repair_delay(&self, delay: Duration) {
        self.lock().repair_delay = delay;
    }

    pub fn set_reserve(&self, name: &str, reserve: SimReserve) {
        self.with_node(name, |node| node.reserve = Some(reserve));
    }

    pub fn uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Every uploaded chunk address, sorted.
    pub fn uploaded_chunks(&self) -> Vec<Address> {
        let mut chunks = self.lock().uploads.clone();
        chunks.sort();
        chunks
    }

    pub fn restarts(&self) -> usize {
        self.lock().restarts
    }

    pub fn repairs(&self) -> usize {
        self.lock().repairs
    }

    pub fn handle(&self, name: &str) -> NamedNode {
        NamedNode::new(
            name,
            Arc::new(SimHandle {
                name: name.to_string(),
                overlay: self.overlay(name),
                state: Arc::clone(&self.state),
            }),
        )
    }
}

#[async_trait]
impl ClusterProvider for SimCluster {
    async fn nodes(&self) -> NodeResult<Vec<NamedNode>> {
        // Reverse name order, so callers that rely on sorting are exercised.
        Ok(self.names().iter().rev().map(|name| self.handle(name)).collect())
    }
}

#[async_trait]
impl NodeRestarter for SimCluster {
    async fn stop(&self, node: &str) -> NodeResult<()> {
        self.lock()
            .node_mut(node)
            .map(|node| node.online = false)
    }

    async fn start(&self, node: &str) -> NodeResult<()> {
        let mut state = self.lock();
        if state.start_failures > 0 {
            state.start_failures -= 1;
            return Err(NodeError::Timeout);
        }
        let sim = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| NodeError::Unavailable(format!("{node} does not exist")))?;
        sim.online = true;
        state.restarts += 1;
        Ok(())
    }
}

struct SimHandle {
    name: String,
    overlay: Address,
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    async fn fault(&self, op: &str) -> NodeResult<()> {
        let fault = self
            .lock()
            .nodes
            .get(&self.name)
            .and_then(|node| node.faults.get(op).copied());
        match fault {
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Fail) => Err(NodeError::Api(format!("{op} rejected by {}", self.name))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NodeHandle for SimHandle {
    fn overlay(&self) -> Address {
        self.overlay.clone()
    }

    async fn topology(&self) -> NodeResult<NodeTopology> {
        let state = self.lock();
        state.node(&self.name)?;
        state
            .topology_of(&self.name)
            .ok_or_else(|| NodeError::NotFound(self.name.clone()))
    }

    async fn upload_chunk(&self, data: Bytes, batch: Option<&BatchId>) -> NodeResult<Address> {
        let mut state = self.lock();
        state.node(&self.name)?;
        let chunk = Blake3Addressing.address(&data);
        let value = batch
            .and_then(|id| state.batches.values().find(|(bid, _)| bid == id).map(|(_, amount)| *amount))
            .unwrap_or(0);

        let mut targets: BTreeSet<String> = state.replicas(&chunk).into_iter().collect();
        targets.insert(self.name.clone());
        let targets: Vec<String> = targets.into_iter().collect();
        state.store_on(&targets, &chunk, &data, value);
        state.uploads.push(chunk.clone());
        Ok(chunk)
    }

    async fn has_chunk(&self, chunk: &Address) -> NodeResult<bool> {
        let mut state = self.lock();
        let node = state.node_mut(&self.name)?;
        if node.probe_failures > 0 {
            node.probe_failures -= 1;
            return Err(NodeError::Timeout);
        }
        Ok(node.store.contains_key(chunk))
    }

    async fn download_chunk(&self, chunk: &Address, routing_hint: Option<&str>) -> NodeResult<Bytes> {
        let (data, delay) = {
            let state = self.lock();
            state.node(&self.name)?;
            if let Some(data) = state.held_by(&self.name, chunk) {
                return Ok(data);
            }
            if let Some(data) = state
                .neighbourhood(chunk)
                .iter()
                .find_map(|name| state.held_by(name, chunk))
            {
                return Ok(data);
            }

            let hint = routing_hint.ok_or_else(|| NodeError::NotFound(chunk.to_hex()))?;
            let data = state
                .nodes
                .iter()
                .filter(|(_, node)| node.overlay.to_hex().starts_with(hint))
                .find_map(|(name, _)| state.held_by(name, chunk))
                .ok_or_else(|| NodeError::NotFound(chunk.to_hex()))?;
            (data, state.repair_delay)
        };

        // Hinted retrieval found a stray copy; the network takes a while to
        // put it back where it belongs.
        tokio::time::sleep(delay).await;

        let mut state = self.lock();
        let replicas = state.replicas(chunk);
        state.store_on(&replicas, chunk, &data, 0);
        state.repairs += 1;
        Ok(data)
    }

    async fn remove_chunk(&self, chunk: &Address) -> NodeResult<()> {
        self.fault("remove").await?;
        let mut state = self.lock();
        let node = state.node_mut(&self.name)?;
        node.cache.retain(|cached| cached != chunk);
        node.store
            .remove(chunk)
            .map(|_| ())
            .ok_or_else(|| NodeError::NotFound(chunk.to_hex()))
    }

    async fn peers(&self) -> NodeResult<Vec<Address>> {
        self.fault("peers").await?;
        let mut state = self.lock();
        let node = state.node_mut(&self.name)?;
        if let Some(left) = node.peer_answers.as_mut() {
            if *left == 0 {
                return Err(NodeError::Unavailable(format!("{} stopped answering peer requests", self.name)));
            }
            *left -= 1;
        }
        Ok(state.peers_of(&self.name))
    }

    async fn pin_chunk(&self, chunk: &Address) -> NodeResult<()> {
        self.fault("pin").await?;
        let mut state = self.lock();
        let node = state.node_mut(&self.name)?;
        if !node.store.contains_key(chunk) {
            return Err(NodeError::NotFound(chunk.to_hex()));
        }
        node.pins.insert(chunk.clone());
        Ok(())
    }

    async fn unpin_chunk(&self, chunk: &Address) -> NodeResult<()> {
        self.fault("unpin").await?;
        let mut state = self.lock();
        state.node_mut(&self.name)?.pins.remove(chunk);
        Ok(())
    }

    async fn pins(&self) -> NodeResult<Vec<Address>> {
        self.fault("pins").await?;
        let state = self.lock();
        Ok(state.node(&self.name)?.pins.iter().cloned().collect())
    }

    async fn create_or_fetch_batch(&self, request: &BatchRequest) -> NodeResult<BatchId> {
        self.fault("batch").await?;
        let mut state = self.lock();
        state.node(&self.name)?;
        let (id, _) = state
            .batches
            .entry(request.label.clone())
            .or_insert_with(|| (BatchId(*blake3::hash(request.label.as_bytes()).as_bytes()), request.amount));
        Ok(id.clone())
    }

    async fn reserve_state(&self) -> NodeResult<ReserveState> {
        self.fault("reserve").await?;
        let state = self.lock();
        let node = state.node(&self.name)?;
        let reserve = node
            .reserve
            .ok_or_else(|| NodeError::Api("reserve state not exposed".into()))?;
        Ok(ReserveState {
            radius: reserve.radius,
            available: reserve.cache_capacity as i64 - node.cache.len() as i64,
            storage_radius: reserve.radius,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_at(overlay: &Address, po: usize, salt: u8) -> Address {
        let mut bytes = overlay.as_bytes().to_vec();
        bytes[ADDRESS_LEN - 1] ^= salt;
        Address::new(bytes).with_flipped_bit(po).unwrap()
    }

    #[test]
    fn reserve_demotes_and_evicts_oldest() {
        let mut node = SimNode::new(Address::zero(ADDRESS_LEN), 0);
        node.reserve = Some(SimReserve::default());

        let low: Vec<Address> = (1..=10).map(|salt| chunk_at(&node.overlay, 1, salt)).collect();
        for (seq, chunk) in low.iter().enumerate() {
            assert_eq!(proximity(chunk, &node.overlay), 1);
            node.put(chunk, Bytes::new(), 1, seq as u64);
        }
        assert!(node.cache.is_empty());

        node.put(&chunk_at(&node.overlay, 2, 0), Bytes::new(), 1, 100);
        assert_eq!(node.cache.len(), 9);
        assert!(!node.store.contains_key(&low[0]));
        assert!(low[1..].iter().all(|chunk| node.store.contains_key(chunk)));
    }

    #[tokio::test]
    async fn uploads_land_on_predicted_replicas() {
        let cluster = SimCluster::uniform(4, 1);
        let uploader = cluster.handle("bee-0");
        let chunk = uploader
            .handle
            .upload_chunk(Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        let mut expected = cluster.predicted(&chunk);
        if !expected.contains(&"bee-0".to_string()) {
            expected.push("bee-0".into());
            expected.sort();
        }
        assert_eq!(cluster.holders(&chunk), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn hinted_download_repairs_after_delay() {
        let cluster = SimCluster::uniform(4, 16);
        cluster.set_repair_delay(Duration::from_secs(7));
        let chunk = cluster
            .handle("bee-0")
            .handle
            .upload_chunk(Bytes::from_static(b"stray"), None)
            .await
            .unwrap();
        for name in cluster.holders(&chunk) {
            if name != "bee-0" {
                cluster.handle(&name).handle.remove_chunk(&chunk).await.unwrap();
            }
        }
        let reader = cluster.handle("bee-2");
        let closest = cluster.closest_name(&chunk);
        if closest != "bee-0" && reader.name != closest {
            assert!(reader.handle.download_chunk(&chunk, None).await.is_err());
        }

        let hint = cluster.overlay("bee-0").prefix_hex(1);
        let start = tokio::time::Instant::now();
        reader.handle.download_chunk(&chunk, Some(&hint)).await.unwrap();
        if closest != "bee-0" {
            assert!(start.elapsed() >= Duration::from_secs(7));
            assert_eq!(cluster.repairs(), 1);
        }
    }

    #[tokio::test]
    async fn stopped_nodes_are_unavailable() {
        let cluster = SimCluster::uniform(2, 0);
        cluster.set_online("bee-1", false);
        let err = cluster.handle("bee-1").handle.topology().await.unwrap_err();
        assert!(matches!(err, NodeError::Unavailable(_)));
    }
}
