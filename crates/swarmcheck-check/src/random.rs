//! Reproducible randomness and chunk mining.
//!
//! One root seed per check invocation is split up front into an
//! independent stream per unit of work (upload node, iteration), so
//! concurrent workers never share a generator and the same seed always
//! yields the same chunks.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use swarmcheck_dht::{proximity, Address};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Root of the per-unit random streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterministicRandom {
    seed: u64,
}

impl DeterministicRandom {
    /// Use a caller-supplied seed.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Draw a fresh seed. The seed is logged so the run can be replayed.
    pub fn generate() -> Self {
        let seed = rand::random::<u64>();
        info!(seed, "generated random seed");
        Self { seed }
    }

    /// Use `seed` if present, otherwise generate one.
    pub fn from_option(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::generate, Self::new)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Split the root into `count` independent streams.
    ///
    /// Stream `i` depends only on the seed and `i`.
    pub fn streams(&self, count: usize) -> Vec<StdRng> {
        let mut root = StdRng::seed_from_u64(self.seed);
        (0..count)
            .map(|_| StdRng::seed_from_u64(root.gen()))
            .collect()
    }
}

/// Fill `size` bytes of chunk payload from `rng`.
pub fn random_data(rng: &mut impl RngCore, size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Computes the address a cluster will assign to chunk data.
///
/// The real content-addressing scheme belongs to the system under test;
/// checks only need it to mine chunks at a chosen proximity.
pub trait ChunkAddressing: Send + Sync {
    fn address(&self, data: &[u8]) -> Address;
}

/// Addresses chunks by their Blake3 hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Addressing;

impl ChunkAddressing for Blake3Addressing {
    fn address(&self, data: &[u8]) -> Address {
        Address::from(*blake3::hash(data).as_bytes())
    }
}

/// A chunk found by rejection sampling.
#[derive(Debug, Clone)]
pub struct MinedChunk {
    pub address: Address,
    pub data: Bytes,
    /// Samples drawn before a hit.
    pub attempts: u64,
}

/// Samples hashed between yields back to the runtime.
const MINING_YIELD_INTERVAL: u64 = 256;

/// Draw random chunks from `rng` until one lands at exactly proximity `po`
/// to `anchor`.
///
/// The loop has no attempt cap; the expected cost doubles with every
/// proximity order. It yields to the runtime every few hundred samples, so
/// wrapping it in a deadline bounds the search. `po` must be below the
/// anchor's bit length.
pub async fn mine_chunk(
    rng: &mut impl RngCore,
    addressing: &dyn ChunkAddressing,
    anchor: &Address,
    po: usize,
    size: usize,
) -> Result<MinedChunk> {
    if po >= anchor.bit_len() {
        return Err(Error::InvalidOptions(format!(
            "cannot mine at proximity {po} for a {}-bit anchor",
            anchor.bit_len()
        )));
    }

    let mut attempts = 0u64;
    loop {
        attempts += 1;
        let data = random_data(rng, size);
        let address = addressing.address(&data);
        if proximity(&address, anchor) == po {
            debug!(%address, %anchor, po, attempts, "mined chunk");
            return Ok(MinedChunk {
                address,
                data,
                attempts,
            });
        }
        if attempts % MINING_YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
    }
}
