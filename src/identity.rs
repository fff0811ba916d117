//! Broker id allocation
//!
//! Works out which broker ids nobody has registered yet and picks one of them
//! to campaign for. The pick is uniform over the sorted set of missing ids, so a
//! seeded generator always produces the same choice.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Ids in `[0, broker_count)` that are not in `registered`
pub fn compute_missing(broker_count: u32, registered: &BTreeSet<u32>) -> BTreeSet<u32> {
    (0..broker_count).filter(|id| !registered.contains(id)).collect()
}

/// Pick one id from `missing` uniformly at random
pub fn pick_candidate<R: Rng>(missing: &BTreeSet<u32>, rng: &mut R) -> Result<u32> {
    if missing.is_empty() {
        return Err(Error::NoIdentityAvailable);
    }
    let index = rng.gen_range(0..missing.len());
    missing
        .iter()
        .nth(index)
        .copied()
        .ok_or(Error::NoIdentityAvailable)
}

/// Seed derived from the wall clock, so consecutive runs usually differ
pub fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Process-local generator, seeded from `seed` or the clock
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    let seed = seed.unwrap_or_else(clock_seed);
    tracing::debug!(seed, "Seeding broker id generator");
    StdRng::seed_from_u64(seed)
}

/// Read the registry snapshot and choose the id to campaign for
pub fn allocate<R: Rng>(
    broker_count: u32,
    registered: &BTreeSet<u32>,
    rng: &mut R,
) -> Result<u32> {
    if !registered.is_empty() {
        tracing::info!(ids = ?registered, "Found these broker IDs in ZooKeeper");
    }

    let missing = compute_missing(broker_count, registered);
    tracing::info!(ids = ?missing, "Missing broker IDs");

    pick_candidate(&missing, rng)
}
