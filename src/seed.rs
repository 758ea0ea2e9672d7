//! Deterministic per-module seeds and the scoped ambient RNG
//!
//! One master seed per session. Every module gets its own seed derived from
//! it with a keyed SHA-256 construction:
//!
//! ```text
//! derived = BE64( SHA-256( "reprobundle-seed-v1" | LE64(master) | LE64(len(name)) | name )[0..8] )
//! ```
//!
//! The derivation never touches `std::hash`, so it is stable across
//! processes, platforms and releases.
//!
//! # Ambient RNG
//!
//! Numerical code that draws from "the" random generator goes through
//! [`with_ambient_rng`]. [`with_scope`] swaps a seeded generator in for the
//! duration of a closure and restores the previous one on every exit path,
//! panics included:
//!
//! ```text
//! thread A: with_scope(s1) ─┬─ with_scope(s2) ─┬─ draw  (rng = s2)
//!                           │                  └─ restore s1
//!                           └─ restore ambient
//! thread B: with_scope(..)  → InvalidState while A holds the scope
//! ```
//!
//! Scopes nest on the owning thread (LIFO). A second thread cannot enter a
//! scope while one is active: this is the one process-wide mutual-exclusion
//! boundary of the crate.

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{debug, info};

use crate::error::{ReproError, Result};

/// Domain-separation tag for seed derivation
const SEED_DOMAIN: &str = "reprobundle-seed-v1";

/// Largest accepted master seed
///
/// Seeds above `i64::MAX` do not survive JSON consumers that read integers
/// as signed 64-bit values.
pub const MAX_MASTER_SEED: u64 = i64::MAX as u64;

/// Master seed plus every seed derived from it during the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSet {
    pub master_seed: u64,
    pub derived: BTreeMap<String, u64>,
}

impl SeedSet {
    /// Pure derivation, usable without a manager
    pub fn derive(&self, module_name: &str) -> u64 {
        derive_seed(self.master_seed, module_name)
    }
}

/// Keyed hash of `(master_seed, module_name)`
pub fn derive_seed(master_seed: u64, module_name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(SEED_DOMAIN.as_bytes());
    hasher.update(master_seed.to_le_bytes());
    hasher.update((module_name.len() as u64).to_le_bytes());
    hasher.update(module_name.as_bytes());
    let digest = hasher.finalize();

    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}

/// Derives and records per-module seeds for one session
#[derive(Debug)]
pub struct SeedManager {
    master_seed: u64,
    derived: Mutex<BTreeMap<String, u64>>,
}

impl SeedManager {
    /// Create a manager from an explicit master seed, or draw one from the OS RNG
    pub fn new(master_seed: Option<u64>) -> Result<Self> {
        let master_seed = match master_seed {
            Some(seed) if seed > MAX_MASTER_SEED => {
                return Err(ReproError::InvalidSeed(format!(
                    "master seed {} exceeds the supported maximum {}",
                    seed, MAX_MASTER_SEED
                )));
            }
            Some(seed) => seed,
            None => {
                let seed = OsRng.gen_range(0..=MAX_MASTER_SEED);
                info!(master_seed = seed, "generated master seed");
                seed
            }
        };

        Ok(Self {
            master_seed,
            derived: Mutex::new(BTreeMap::new()),
        })
    }

    /// Parse a master seed given as text (config files, environment variables)
    pub fn parse_seed(text: &str) -> Result<u64> {
        let seed: i128 = text
            .trim()
            .parse()
            .map_err(|e| ReproError::InvalidSeed(format!("'{}' is not an integer: {}", text, e)))?;
        if seed < 0 || seed > i128::from(MAX_MASTER_SEED) {
            return Err(ReproError::InvalidSeed(format!(
                "master seed {} is outside 0..={}",
                seed, MAX_MASTER_SEED
            )));
        }
        Ok(seed as u64)
    }

    /// Rebuild a manager from a recorded seed set
    pub fn from_seed_set(seeds: &SeedSet) -> Result<Self> {
        let manager = Self::new(Some(seeds.master_seed))?;
        for name in seeds.derived.keys() {
            manager.derive(name);
        }
        Ok(manager)
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Derive (and record) the seed for `module_name`
    pub fn derive(&self, module_name: &str) -> u64 {
        let seed = derive_seed(self.master_seed, module_name);
        let mut derived = lock_ignoring_poison(&self.derived);
        if derived.insert(module_name.to_string(), seed).is_none() {
            debug!(module = module_name, seed, "derived module seed");
        }
        seed
    }

    /// Snapshot of the master seed and all seeds derived so far
    pub fn seed_set(&self) -> SeedSet {
        SeedSet {
            master_seed: self.master_seed,
            derived: lock_ignoring_poison(&self.derived).clone(),
        }
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Ambient RNG
// ============================================================================

struct AmbientRng {
    current: Option<StdRng>,
    saved: Vec<Option<StdRng>>,
    owner: Option<ThreadId>,
}

static AMBIENT: Mutex<AmbientRng> = Mutex::new(AmbientRng {
    current: None,
    saved: Vec::new(),
    owner: None,
});

/// Restores the previous ambient generator when dropped
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut ambient = lock_ignoring_poison(&AMBIENT);
        ambient.current = ambient.saved.pop().flatten();
        if ambient.saved.is_empty() {
            ambient.owner = None;
        }
    }
}

/// Run `f` with the ambient RNG seeded from `seed`
///
/// The previous ambient state is restored when `f` returns or unwinds.
/// Fails with `InvalidState` if another thread holds a scope.
pub fn with_scope<T>(seed: u64, f: impl FnOnce() -> T) -> Result<T> {
    let me = thread::current().id();
    {
        let mut ambient = lock_ignoring_poison(&AMBIENT);
        if let Some(owner) = ambient.owner {
            if owner != me {
                return Err(ReproError::InvalidState(
                    "a seeded scope is already active on another thread".to_string(),
                ));
            }
        }
        let previous = ambient.current.replace(StdRng::seed_from_u64(seed));
        ambient.saved.push(previous);
        ambient.owner = Some(me);
    }

    let _guard = ScopeGuard;
    Ok(f())
}

/// Draw from the ambient RNG
///
/// Outside any scope the generator is entropy-seeded on first use.
pub fn with_ambient_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut ambient = lock_ignoring_poison(&AMBIENT);
    let rng = ambient.current.get_or_insert_with(StdRng::from_entropy);
    f(rng)
}

/// Nesting depth of the active scope on this process (0 = none)
pub fn scope_depth() -> usize {
    lock_ignoring_poison(&AMBIENT).saved.len()
}
