//! Closest-node and farthest-pair selection.
//!
//! Selection is order-stable: on equal distance the candidate that comes
//! first wins. Callers iterating maps must sort first; [`closest_named`]
//! does that for them.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::metric::distance;
use crate::{Address, Distance, Error, Result, MIN_REPAIR_NODES};

/// Connected-peer lists keyed by overlay.
pub type PeerLists = HashMap<Address, Vec<Address>>;

/// Answers "whom is this node connected to".
pub trait AdjacencyOracle {
    /// Peer list of `node`, or `None` if the node is unknown.
    fn peers_of(&self, node: &Address) -> Option<&[Address]>;

    /// Whether `a` lists `b` as a peer.
    fn is_adjacent(&self, a: &Address, b: &Address) -> bool {
        self.peers_of(a).is_some_and(|peers| peers.contains(b))
    }
}

impl AdjacencyOracle for HashMap<Address, Vec<Address>> {
    fn peers_of(&self, node: &Address) -> Option<&[Address]> {
        self.get(node).map(Vec::as_slice)
    }
}

impl AdjacencyOracle for BTreeMap<Address, Vec<Address>> {
    fn peers_of(&self, node: &Address) -> Option<&[Address]> {
        self.get(node).map(Vec::as_slice)
    }
}

/// Find the candidate closest to `target`.
///
/// Replaces the running best only on a strictly smaller distance, so the
/// earliest of equally distant candidates is returned.
pub fn closest<'a>(target: &Address, candidates: &'a [Address]) -> Result<&'a Address> {
    let (first, rest) = candidates.split_first().ok_or(Error::EmptyCandidateSet)?;
    let mut best = first;
    let mut best_dist = distance(target, first)?;

    for candidate in rest {
        let dist = distance(target, candidate)?;
        if dist < best_dist {
            best = candidate;
            best_dist = dist;
        }
    }

    Ok(best)
}

/// Find the closest of a set of named candidates.
///
/// Names are sorted before scanning so the result does not depend on the
/// iteration order of whatever map the candidates came from.
pub fn closest_named<'a, N, I>(target: &Address, candidates: I) -> Result<(&'a N, &'a Address)>
where
    N: Ord + ?Sized + 'a,
    I: IntoIterator<Item = (&'a N, &'a Address)>,
{
    let mut named: Vec<(&N, &Address)> = candidates.into_iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    let mut best: Option<((&N, &Address), Distance)> = None;
    for (name, addr) in named {
        let dist = distance(target, addr)?;
        if best.as_ref().map_or(true, |(_, best_dist)| dist < *best_dist) {
            best = Some(((name, addr), dist));
        }
    }

    best.map(|(pair, _)| pair).ok_or(Error::EmptyCandidateSet)
}

/// The `k` candidates closest to `target`, nearest first.
///
/// Equal distances keep their input order.
pub fn k_closest<'a>(target: &Address, candidates: &'a [Address], k: usize) -> Result<Vec<&'a Address>> {
    let mut ranked = candidates
        .iter()
        .map(|c| distance(target, c).map(|d| (d, c)))
        .collect::<Result<Vec<_>>>()?;
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ranked.into_iter().take(k).map(|(_, c)| c).collect())
}

/// Pick the two mutually unconnected nodes farthest apart around `anchor`.
///
/// The first node `a` must list `anchor` among its peers; the second `c`
/// is any other known node that is neither in `a`'s peer list nor lists
/// `a` itself. Returns `(a, c)` maximising `distance(a, c)`, earliest pair
/// winning ties.
///
/// Needs at least [`MIN_REPAIR_NODES`] distinct candidates.
pub fn farthest_pair<O>(anchor: &Address, candidates: &[Address], adjacency: &O) -> Result<(Address, Address)>
where
    O: AdjacencyOracle + ?Sized,
{
    let distinct: HashSet<&Address> = candidates.iter().collect();
    if distinct.len() < MIN_REPAIR_NODES {
        return Err(Error::InsufficientTopology {
            known: distinct.len(),
            needed: MIN_REPAIR_NODES,
        });
    }

    let mut best: Option<(&Address, &Address, Distance)> = None;

    for a in candidates.iter().filter(|a| *a != anchor) {
        let Some(peers) = adjacency.peers_of(a) else {
            continue;
        };
        if !peers.contains(anchor) {
            continue;
        }

        for c in candidates {
            if c == a || c == anchor || peers.contains(c) || adjacency.is_adjacent(c, a) {
                continue;
            }
            let dist = distance(a, c)?;
            if best.as_ref().map_or(true, |(_, _, best_dist)| dist > *best_dist) {
                best = Some((a, c, dist));
            }
        }
    }

    best.map(|(a, c, _)| (a.clone(), c.clone()))
        .ok_or(Error::FullConnectivity)
}
