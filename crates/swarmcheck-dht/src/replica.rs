//! Replica prediction.
//!
//! Answers: given the current topology, which nodes must end up holding a
//! chunk? A node is expected to hold it when the chunk falls inside its
//! own storage radius, or when it shares a bin with the closest node from
//! the chunk's point of view.

use serde::Serialize;

use crate::metric::proximity;
use crate::{Address, Error, Result, TopologySnapshot};

/// Why a node was included in a [`ReplicaSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaReason {
    /// The chunk's proximity to the node reaches the node's depth.
    WithinDepth,
    /// The node is outside its depth but in the same bin as the closest node.
    SameBinAsClosest,
    /// The globally closest node, included unconditionally.
    Closest,
}

impl std::fmt::Display for ReplicaReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WithinDepth => f.write_str("within-depth"),
            Self::SameBinAsClosest => f.write_str("same-bin-as-closest"),
            Self::Closest => f.write_str("closest"),
        }
    }
}

/// A predicted holder of a chunk, with the inputs that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replica {
    pub name: String,
    pub overlay: Address,
    /// Proximity between the chunk and this node.
    pub proximity: usize,
    /// The node's depth at snapshot time.
    pub depth: usize,
    pub reason: ReplicaReason,
}

impl std::fmt::Display for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, po={}, depth={}, {})",
            self.name, self.overlay, self.proximity, self.depth, self.reason
        )
    }
}

/// Nodes expected to hold a chunk, in snapshot name order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaSet {
    chunk: Address,
    closest: usize,
    replicas: Vec<Replica>,
}

impl ReplicaSet {
    /// The chunk this set was predicted for.
    pub fn chunk(&self) -> &Address {
        &self.chunk
    }

    /// The globally closest node. Always a member.
    pub fn closest(&self) -> &Replica {
        &self.replicas[self.closest]
    }

    /// Iterate members in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Never true for a set returned by [`predict`].
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Check membership by node name.
    pub fn contains(&self, name: &str) -> bool {
        self.replicas.iter().any(|r| r.name == name)
    }

    /// Member names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.replicas.iter().map(|r| r.name.as_str())
    }
}

impl<'a> IntoIterator for &'a ReplicaSet {
    type Item = &'a Replica;
    type IntoIter = std::slice::Iter<'a, Replica>;

    fn into_iter(self) -> Self::IntoIter {
        self.replicas.iter()
    }
}

/// Predict which nodes of `snapshot` should hold `chunk`.
///
/// Fails with [`Error::EmptyTopology`] on an empty snapshot. Otherwise the
/// returned set is non-empty and contains the closest node.
pub fn predict(chunk: &Address, snapshot: &TopologySnapshot) -> Result<ReplicaSet> {
    let (closest_name, closest_node) = snapshot.closest(chunk)?;
    let closest_overlay = &closest_node.overlay;

    let mut replicas = Vec::new();
    let mut closest_index = None;

    for (name, node) in snapshot.nodes() {
        let po = proximity(chunk, &node.overlay);
        let reason = if po >= node.depth {
            Some(ReplicaReason::WithinDepth)
        } else if name != closest_name && po == proximity(closest_overlay, &node.overlay) {
            Some(ReplicaReason::SameBinAsClosest)
        } else if name == closest_name {
            Some(ReplicaReason::Closest)
        } else {
            None
        };

        if let Some(reason) = reason {
            if name == closest_name {
                closest_index = Some(replicas.len());
            }
            replicas.push(Replica {
                name: name.to_string(),
                overlay: node.overlay.clone(),
                proximity: po,
                depth: node.depth,
                reason,
            });
        }
    }

    let closest = closest_index.ok_or(Error::EmptyTopology)?;
    Ok(ReplicaSet {
        chunk: chunk.clone(),
        closest,
        replicas,
    })
}
