//! Reprobundle - reproducibility bundles for statistical analyses
//!
//! A [`Session`] records what an analysis did while it runs: content
//! fingerprints of its input data, the per-module seeds it drew from, an
//! ordered log of steps and decisions, each module's final result and an
//! opaque snapshot of module state. [`Session::freeze`] turns that record
//! into an immutable, checksummed [`Bundle`] that can be exported as JSON,
//! MessagePack or a zip container, imported again (integrity-checked), and
//! verified against fresh data by replaying modules within tolerance.
//!
//! ```no_run
//! use reprobundle::{create_session, Column, Dataset, ReplayHooks, ReplayInput, VerifyConfig};
//! use serde_json::{json, Value};
//! use std::collections::BTreeMap;
//!
//! # fn main() -> anyhow::Result<()> {
//! let session = create_session(Some(42))?;
//! let data = Dataset::table(vec![Column::float("score", vec![1.5, 2.5, 3.5])])?;
//! session.fingerprint("trial", &data)?;
//! let mean = session.track("mean", "descriptives", || -> anyhow::Result<f64> { Ok(2.5) })?;
//! session.record_result("descriptives", &json!({ "mean": mean }))?;
//! let bundle = session.freeze()?;
//!
//! let mut fresh = BTreeMap::new();
//! fresh.insert("trial".to_string(), data);
//! let hooks = ReplayHooks::new().with("descriptives", |_: &ReplayInput| -> anyhow::Result<Value> {
//!     Ok(json!({ "mean": 2.5 }))
//! })?;
//! let report = reprobundle::verify(&bundle, &fresh, &hooks, &VerifyConfig::default())?;
//! assert!(report.passed);
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod cancel;
pub mod canonical;
pub mod config;
pub mod dataset;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod logging;
mod methods;
pub mod names;
pub mod pipeline;
pub mod seed;
pub mod serializer;
pub mod session;
pub mod state_capture;
pub mod verifier;

pub use bundle::Bundle;
pub use cancel::CancellationToken;
pub use config::{ExportSettings, ReproConfig, SessionSettings, VerifyConfig};
pub use dataset::{Column, ColumnData, ColumnType, Dataset, Layout, Matrix};
pub use environment::EnvironmentInfo;
pub use error::{DataIntegrityKind, ReproError, Result};
pub use fingerprint::{fingerprint, Fingerprint, VerifyOutcome};
pub use pipeline::{DecisionPoint, PipelineStep, StepHandle, StepStatus};
pub use seed::{derive_seed, with_ambient_rng, with_scope, SeedManager, SeedSet};
pub use serializer::{
    export, export_to_dir, export_to_path, import, import_from_dir, import_from_path,
    BundleFormat, Compression,
};
pub use session::Session;
pub use state_capture::{CaptureFailure, ModuleStateSnapshot, StateProvider};
pub use verifier::{
    verify, Mismatch, MismatchKind, ReplayHook, ReplayHooks, ReplayInput, VerificationResult,
    Verifier,
};

/// Start a session with default settings and an optional master seed
pub fn create_session(master_seed: Option<u64>) -> Result<Session> {
    Session::new(&SessionSettings {
        master_seed,
        ..SessionSettings::default()
    })
}
