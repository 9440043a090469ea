use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Deterministic pseudo-random bytes, so chunk boundaries are stable across runs.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut data = vec![0; len];
    rng.fill_bytes(&mut data);
    data
}
