//! Configuration for sessions, verification and export
//!
//! Loaded from a TOML file, then optionally overridden from the environment.
//!
//! # Example reprobundle.toml
//!
//! ```toml
//! [session]
//! creator = "j.doe"
//! description = "pilot power analysis"
//! master_seed = 42
//!
//! [verify]
//! absolute_tolerance = 1e-9
//! relative_tolerance = 0.0
//! replay_timeout_ms = 30000
//!
//! [export]
//! format = "zip"
//! compression = "deflate"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ReproError, Result};
use crate::seed::{SeedManager, MAX_MASTER_SEED};
use crate::serializer::{BundleFormat, Compression};

/// Environment variable overriding `session.master_seed`
pub const ENV_MASTER_SEED: &str = "REPRO_MASTER_SEED";
/// Environment variable overriding `session.creator`
pub const ENV_CREATOR: &str = "REPRO_CREATOR";
/// Environment variable overriding `verify.absolute_tolerance`
pub const ENV_TOLERANCE: &str = "REPRO_TOLERANCE";
/// Environment variable overriding `verify.replay_timeout_ms`
pub const ENV_REPLAY_TIMEOUT_MS: &str = "REPRO_REPLAY_TIMEOUT_MS";

/// Settings for a new session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Who ran the analysis
    pub creator: String,
    /// Free-text description, copied into the methods text
    pub description: String,
    /// Master seed; drawn from the OS RNG when absent
    pub master_seed: Option<u64>,
}

impl SessionSettings {
    pub fn with_master_seed(mut self, seed: u64) -> Self {
        self.master_seed = Some(seed);
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(seed) = self.master_seed {
            if seed > MAX_MASTER_SEED {
                return Err(ReproError::InvalidSeed(format!(
                    "session.master_seed must be <= {}, got {}",
                    MAX_MASTER_SEED, seed
                )));
            }
        }
        Ok(())
    }
}

/// Tolerances and time limits used when verifying a bundle
///
/// A replayed float `a` matches a stored float `e` when
/// `|e - a| <= absolute_tolerance` or
/// `|e - a| <= relative_tolerance * max(|e|, |a|)`.
///
/// # Example
/// ```
/// use reprobundle::VerifyConfig;
///
/// let config = VerifyConfig::default();
/// assert_eq!(config.absolute_tolerance, 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Absolute float tolerance
    ///
    /// Default: 1e-9
    pub absolute_tolerance: f64,

    /// Relative float tolerance, scaled by the larger magnitude
    ///
    /// Default: 0.0 (absolute comparison only)
    pub relative_tolerance: f64,

    /// Per-module replay time limit in milliseconds
    ///
    /// Default: 30000
    pub replay_timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            absolute_tolerance: 1e-9,
            relative_tolerance: 0.0,
            replay_timeout_ms: 30_000,
        }
    }
}

impl VerifyConfig {
    /// Exact-as-possible comparison with a short replay budget
    pub fn strict() -> Self {
        Self {
            absolute_tolerance: 1e-12,
            relative_tolerance: 0.0,
            replay_timeout_ms: 10_000,
        }
    }

    /// Tolerates BLAS/platform level float drift
    pub fn permissive() -> Self {
        Self {
            absolute_tolerance: 1e-6,
            relative_tolerance: 1e-6,
            replay_timeout_ms: 120_000,
        }
    }

    pub fn with_tolerance(mut self, absolute: f64) -> Self {
        self.absolute_tolerance = absolute;
        self
    }

    pub fn with_relative_tolerance(mut self, relative: f64) -> Self {
        self.relative_tolerance = relative;
        self
    }

    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    /// Whether `expected` and `actual` agree within tolerance
    pub fn floats_match(&self, expected: f64, actual: f64) -> bool {
        let delta = (expected - actual).abs();
        delta <= self.absolute_tolerance
            || delta <= self.relative_tolerance * expected.abs().max(actual.abs())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.absolute_tolerance.is_finite() || self.absolute_tolerance < 0.0 {
            return Err(ReproError::InvalidConfig(format!(
                "verify.absolute_tolerance must be a non-negative number, got {}",
                self.absolute_tolerance
            )));
        }
        if !self.relative_tolerance.is_finite() || self.relative_tolerance < 0.0 {
            return Err(ReproError::InvalidConfig(format!(
                "verify.relative_tolerance must be a non-negative number, got {}",
                self.relative_tolerance
            )));
        }
        if self.replay_timeout_ms == 0 {
            return Err(ReproError::InvalidConfig(
                "verify.replay_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default container settings for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub format: BundleFormat,
    pub compression: Compression,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            format: BundleFormat::Zip,
            compression: Compression::Deflate,
        }
    }
}

impl ExportSettings {
    pub fn validate(&self) -> Result<()> {
        crate::serializer::check_options(self.format, self.compression)
    }
}

/// Root configuration (`reprobundle.toml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReproConfig {
    pub session: SessionSettings,
    pub verify: VerifyConfig,
    pub export: ExportSettings,
}

impl ReproConfig {
    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ReproError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML content
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ReproError::InvalidConfig(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REPRO_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `REPRO_*` overrides read through `lookup`
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(seed) = lookup(ENV_MASTER_SEED) {
            self.session.master_seed = Some(SeedManager::parse_seed(&seed)?);
        }
        if let Some(creator) = lookup(ENV_CREATOR) {
            self.session.creator = creator;
        }
        if let Some(tolerance) = lookup(ENV_TOLERANCE) {
            self.verify.absolute_tolerance = tolerance.trim().parse().map_err(|e| {
                ReproError::InvalidConfig(format!("{}='{}': {}", ENV_TOLERANCE, tolerance, e))
            })?;
        }
        if let Some(timeout) = lookup(ENV_REPLAY_TIMEOUT_MS) {
            self.verify.replay_timeout_ms = timeout.trim().parse().map_err(|e| {
                ReproError::InvalidConfig(format!(
                    "{}='{}': {}",
                    ENV_REPLAY_TIMEOUT_MS, timeout, e
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.verify.validate()?;
        self.export.validate()
    }
}
