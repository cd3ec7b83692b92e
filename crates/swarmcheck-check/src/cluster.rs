//! Reading cluster state through the collaborator traits.

use futures::future::try_join_all;
use swarmcheck_dht::{PeerLists, TopologySnapshot};
use tracing::debug;

use crate::error::{Error, NodeResultExt, Result};
use crate::node::{ClusterProvider, NamedNode};
use crate::retry::Retry;

/// Live nodes, sorted by name.
pub async fn sorted_nodes(cluster: &dyn ClusterProvider) -> Result<Vec<NamedNode>> {
    let mut nodes = cluster.nodes().await.on("cluster")?;
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}

/// Find a node by name.
pub fn find_node<'a>(nodes: &'a [NamedNode], name: &str) -> Result<&'a NamedNode> {
    nodes
        .iter()
        .find(|node| node.name == name)
        .ok_or_else(|| Error::Precondition(format!("node {name} is not part of the cluster")))
}

/// Fetch every node's topology into one snapshot.
///
/// A failure on any node fails the attempt as a whole; the capture is
/// retried under `retry` so a snapshot never mixes two attempts.
pub async fn capture_snapshot(nodes: &[NamedNode], retry: &Retry) -> Result<TopologySnapshot> {
    let snapshot = retry
        .poll(|attempt| async move {
            let topologies = try_join_all(nodes.iter().map(|node| async move {
                let topology = node.handle.topology().await.on(&node.name)?;
                Ok::<_, Error>((node.name.clone(), topology))
            }))
            .await?;
            debug!(attempt, nodes = topologies.len(), "captured topology snapshot");
            Ok(Some(TopologySnapshot::new(topologies)))
        })
        .await?;
    Ok(snapshot)
}

/// Connected-peer lists of every node, as reported by the nodes.
pub async fn fetch_peer_lists(nodes: &[NamedNode]) -> Result<PeerLists> {
    let lists = try_join_all(nodes.iter().map(|node| async move {
        let peers = node.handle.peers().await.on(&node.name)?;
        Ok::<_, Error>((node.handle.overlay(), peers))
    }))
    .await?;
    Ok(lists.into_iter().collect())
}
