//! Per-iteration topology snapshots.
//!
//! A snapshot records, for every node in the cluster, its overlay, its
//! self-reported depth and its Kademlia bins. It is built once per check
//! iteration and never changed afterwards; a fresh one is taken whenever
//! fresh state is needed.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::closest::{closest_named, PeerLists};
use crate::metric::proximity;
use crate::{Address, Error, Result};

/// Peers of a node at one proximity order.
///
/// `population` counts every peer the node knows in this bin, which may be
/// more than the peers listed here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    pub population: u64,
    pub connected: Vec<Address>,
    pub disconnected: Vec<Address>,
}

impl Bin {
    /// A bin with the given connected peers and matching population.
    pub fn connected(peers: Vec<Address>) -> Self {
        Self {
            population: peers.len() as u64,
            connected: peers,
            disconnected: Vec::new(),
        }
    }
}

/// One node's view of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    /// The node's overlay address.
    pub overlay: Address,
    /// Neighbourhood depth (storage radius).
    pub depth: usize,
    /// Bins keyed by proximity order.
    pub bins: BTreeMap<usize, Bin>,
}

impl NodeTopology {
    /// A node with no known peers.
    pub fn new(overlay: Address, depth: usize) -> Self {
        Self {
            overlay,
            depth,
            bins: BTreeMap::new(),
        }
    }

    /// Build a node connected to `peers`, binned by proximity to `overlay`.
    pub fn with_peers<'a>(overlay: Address, depth: usize, peers: impl IntoIterator<Item = &'a Address>) -> Self {
        let mut node = Self::new(overlay, depth);
        for peer in peers {
            if *peer == node.overlay {
                continue;
            }
            let po = proximity(&node.overlay, peer);
            let bin = node.bins.entry(po).or_default();
            bin.population += 1;
            bin.connected.push(peer.clone());
        }
        node
    }

    /// All connected peers, lowest bin first.
    pub fn connected_peers(&self) -> impl Iterator<Item = &Address> {
        self.bins.values().flat_map(|bin| bin.connected.iter())
    }

    /// Check whether `peer` is listed as connected.
    pub fn is_connected_to(&self, peer: &Address) -> bool {
        let po = proximity(&self.overlay, peer);
        self.bins.get(&po).is_some_and(|bin| bin.connected.contains(peer))
    }

    /// Total population over all bins.
    pub fn population(&self) -> u64 {
        self.bins.values().map(|bin| bin.population).sum()
    }
}

/// Immutable view of every node's topology, keyed by node name.
///
/// Names iterate in sorted order, which fixes the order of every scan
/// made against the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    nodes: BTreeMap<String, NodeTopology>,
}

impl TopologySnapshot {
    /// Build a snapshot from `(name, topology)` pairs.
    pub fn new(nodes: impl IntoIterator<Item = (String, NodeTopology)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// `(name, topology)` pairs in name order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeTopology)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Topology of a named node.
    pub fn node(&self, name: &str) -> Option<&NodeTopology> {
        self.nodes.get(name)
    }

    /// All overlays, in name order.
    pub fn overlays(&self) -> Vec<Address> {
        self.nodes.values().map(|node| node.overlay.clone()).collect()
    }

    /// Name of the node with the given overlay.
    pub fn name_of(&self, overlay: &Address) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, node)| node.overlay == *overlay)
            .map(|(name, _)| name.as_str())
    }

    /// The node closest to `target`, earliest name winning ties.
    pub fn closest(&self, target: &Address) -> Result<(&str, &NodeTopology)> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyTopology);
        }
        let (name, _) = closest_named(
            target,
            self.nodes.iter().map(|(name, node)| (name.as_str(), &node.overlay)),
        )?;
        let node = &self.nodes[name];
        Ok((name, node))
    }

    /// Connected-peer lists for every node, for use as an adjacency oracle.
    pub fn peer_lists(&self) -> PeerLists {
        self.nodes
            .values()
            .map(|node| (node.overlay.clone(), node.connected_peers().cloned().collect()))
            .collect::<HashMap<_, _>>()
    }
}
