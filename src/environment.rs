//! Environment metadata recorded with every bundle
//!
//! Captured once when a session starts, so freezing the same session twice
//! sees the same environment.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Environment variables whose values influence numerical results
const TRACKED_ENV_VARS: &[&str] = &[
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "RAYON_NUM_THREADS",
    "LANG",
    "TZ",
];

/// Where and with what an analysis ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub producer: String,
    pub producer_version: String,
    pub os: String,
    pub arch: String,
    pub family: String,
    pub cpu_count: usize,
    /// SHA-256 over the tracked environment variables
    pub env_vars_hash: String,
    /// Versions of numerical libraries reported by the caller
    pub libraries: BTreeMap<String, String>,
}

impl EnvironmentInfo {
    pub fn capture() -> Self {
        Self {
            producer: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            env_vars_hash: Self::compute_env_vars_hash(),
            libraries: BTreeMap::new(),
        }
    }

    /// Record a library version
    pub fn with_library(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.libraries.insert(name.into(), version.into());
        self
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in TRACKED_ENV_VARS {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// One-line description for logs and methods text
    pub fn describe(&self) -> String {
        format!(
            "{} v{} on {}/{} ({} CPUs)",
            self.producer, self.producer_version, self.os, self.arch, self.cpu_count
        )
    }
}
