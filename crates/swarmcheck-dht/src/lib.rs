//! Swarmcheck DHT model
//!
//! A predictive model of how a Kademlia storage network places chunks.
//! Nothing here talks to a node: every function is pure and operates on
//! addresses and topology snapshots handed in by the caller.
//!
//! # Design
//!
//! Overlay addresses and chunk addresses live in the same space. The
//! distance between two addresses is their XOR read as a big-endian
//! unsigned integer; proximity order (PO) is the number of leading bits
//! they share. Higher proximity means smaller distance.
//!
//! # Replica prediction
//!
//! Given a chunk address and a [`TopologySnapshot`], [`predict`] lists the
//! nodes expected to hold the chunk:
//!
//! ```text
//! closest  = node with minimal XOR distance to the chunk
//! for each node n:
//!     po(chunk, n) >= n.depth                  -> within-depth
//!     po(chunk, n) == po(closest, n)           -> same-bin-as-closest
//! closest is always a member
//! ```

mod address;
mod closest;
mod error;
mod metric;
mod replica;
mod topology;

pub use address::Address;
pub use closest::{closest, closest_named, farthest_pair, k_closest, AdjacencyOracle, PeerLists};
pub use error::{Error, Result};
pub use metric::{distance, distance_cmp, proximity, Distance};
pub use replica::{predict, Replica, ReplicaReason, ReplicaSet};
pub use topology::{Bin, NodeTopology, TopologySnapshot};

/// Address width used by swarm overlays and chunk references, in bytes.
pub const ADDRESS_LEN: usize = 32;

/// Minimum number of distinct nodes a chunk repair scenario needs:
/// an uploader, a replica holder and a distant downloader.
pub const MIN_REPAIR_NODES: usize = 3;
