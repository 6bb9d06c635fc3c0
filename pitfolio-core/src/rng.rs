//! Deterministic RNG hierarchy.
//!
//! A master seed generates deterministic sub-seeds per `(asset, stream)`.
//! Sub-seeds are derived via BLAKE3 hashing, independently of the order in
//! which assets are generated, so output is identical regardless of thread
//! count or universe ordering.

use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Debug, Clone)]
pub struct SeedHierarchy {
    master_seed: u64,
}

impl SeedHierarchy {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Sub-seed for one asset and one named stream (e.g. "walk", "gaps").
    pub fn sub_seed(&self, asset: &str, stream: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(asset.as_bytes());
        hasher.update(&[0]);
        hasher.update(stream.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn rng_for(&self, asset: &str, stream: &str) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(asset, stream))
    }
}
