//! Verification of a bundle against fresh data and replayed modules
//!
//! Verification never fails because the analysis did not reproduce: every
//! discrepancy becomes a [`Mismatch`] in the [`VerificationResult`]. Only an
//! unusable configuration is an error.
//!
//! The checks run in a fixed order:
//! 1. every recorded dataset is re-fingerprinted from the fresh data
//! 2. every recorded seed is re-derived from the master seed
//! 3. every module with a replay hook is re-executed on its own thread with
//!    its own time limit, and its output compared with the stored result

use crossbeam::channel::{self, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::bundle::Bundle;
use crate::config::VerifyConfig;
use crate::dataset::Dataset;
use crate::error::{ReproError, Result};
use crate::fingerprint::{self, VerifyOutcome};
use crate::names::validate_name;
use crate::seed::derive_seed;
use crate::state_capture::panic_message;

/// Everything a replay hook gets to recompute a module's result
#[derive(Debug, Clone)]
pub struct ReplayInput {
    pub module: String,
    /// Seed derived for this module from the bundle's master seed
    pub seed: u64,
    /// Fresh datasets, keyed by the names used when fingerprinting
    pub data: Arc<BTreeMap<String, Dataset>>,
    /// Inputs of the module's last recorded step (`null` if none)
    pub parameters: Value,
}

impl ReplayInput {
    /// Generator seeded exactly as the module's original run
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.data.get(name)
    }
}

/// Re-executes one module's computation
pub trait ReplayHook: Send + Sync {
    fn replay(&self, input: &ReplayInput) -> anyhow::Result<Value>;
}

impl<F> ReplayHook for F
where
    F: Fn(&ReplayInput) -> anyhow::Result<Value> + Send + Sync,
{
    fn replay(&self, input: &ReplayInput) -> anyhow::Result<Value> {
        self(input)
    }
}

/// Replay hooks keyed by module name
#[derive(Clone, Default)]
pub struct ReplayHooks {
    hooks: BTreeMap<String, Arc<dyn ReplayHook>>,
}

impl std::fmt::Debug for ReplayHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayHooks")
            .field("modules", &self.modules())
            .finish()
    }
}

impl ReplayHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: &str, hook: impl ReplayHook + 'static) -> Result<()> {
        validate_name(module)?;
        if self.hooks.contains_key(module) {
            return Err(ReproError::InvalidState(format!(
                "a replay hook for '{}' is already registered",
                module
            )));
        }
        self.hooks.insert(module.to_string(), Arc::new(hook));
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, module: &str, hook: impl ReplayHook + 'static) -> Result<Self> {
        self.register(module, hook)?;
        Ok(self)
    }

    pub fn modules(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// What kind of discrepancy was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Fresh data differs from the recorded fingerprint
    DataMismatch,
    /// A recorded dataset was not supplied
    MissingData,
    /// A recorded seed does not re-derive from the master seed
    SeedMismatch,
    /// Replayed output differs from the stored result
    ReplayMismatch,
    /// Replay exceeded its time limit
    ReplayTimeout,
    /// Replay hook returned an error or panicked
    ReplayFailed,
    /// A hook exists but the bundle has no stored result to compare with
    MissingResult,
}

/// One discrepancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub kind: MismatchKind,
    /// Dataset or module the mismatch concerns
    pub subject: String,
    /// Field path within the subject, e.g. `t_test.ci[1]`
    pub path: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    /// Absolute difference, for float mismatches
    pub delta: Option<f64>,
    pub detail: String,
}

impl Mismatch {
    fn new(kind: MismatchKind, subject: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.to_string(),
            path: subject.to_string(),
            expected: None,
            actual: None,
            delta: None,
            detail: detail.into(),
        }
    }

    fn values(mut self, expected: Option<Value>, actual: Option<Value>) -> Self {
        self.expected = expected;
        self.actual = actual;
        self
    }
}

/// Report produced by a verification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// True iff there are no mismatches
    pub passed: bool,
    pub mismatches: Vec<Mismatch>,
    pub checked_datasets: Vec<String>,
    /// Modules whose replay finished and was compared; timeouts and failures are left out
    pub replayed_modules: Vec<String>,
}

impl VerificationResult {
    pub fn mismatches_of(&self, kind: MismatchKind) -> impl Iterator<Item = &Mismatch> {
        self.mismatches.iter().filter(move |m| m.kind == kind)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "verification {}: {} datasets checked, {} modules replayed, {} mismatches",
            if self.passed { "passed" } else { "failed" },
            self.checked_datasets.len(),
            self.replayed_modules.len(),
            self.mismatches.len()
        )
    }
}

/// Verifies bundles with one configuration
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifyConfig,
}

impl Verifier {
    pub fn new(config: VerifyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    pub fn verify(
        &self,
        bundle: &Bundle,
        fresh: &BTreeMap<String, Dataset>,
        hooks: &ReplayHooks,
    ) -> VerificationResult {
        let mut mismatches = Vec::new();
        let checked_datasets = self.check_data(bundle, fresh, &mut mismatches);
        self.check_seeds(bundle, &mut mismatches);
        let replayed_modules = self.replay_all(bundle, fresh, hooks, &mut mismatches);

        for m in &mismatches {
            warn!(
                kind = ?m.kind,
                subject = %m.subject,
                path = %m.path,
                detail = %m.detail,
                "verification mismatch"
            );
        }
        let result = VerificationResult {
            passed: mismatches.is_empty(),
            mismatches,
            checked_datasets,
            replayed_modules,
        };
        info!(bundle = %bundle.id(), "{}", result.summary_line());
        result
    }

    fn check_data(
        &self,
        bundle: &Bundle,
        fresh: &BTreeMap<String, Dataset>,
        mismatches: &mut Vec<Mismatch>,
    ) -> Vec<String> {
        let mut checked = Vec::new();
        for (name, expected) in bundle.fingerprints() {
            let Some(dataset) = fresh.get(name) else {
                mismatches.push(Mismatch::new(
                    MismatchKind::MissingData,
                    name,
                    "dataset was not supplied",
                ));
                continue;
            };
            checked.push(name.clone());
            match fingerprint::verify(dataset, expected) {
                Ok(VerifyOutcome::Match) => debug!(dataset = %name, "dataset matches"),
                Ok(VerifyOutcome::ShapeMismatch { expected, actual }) => {
                    let mut m = Mismatch::new(MismatchKind::DataMismatch, name, "shape differs")
                        .values(Some(expected.into()), Some(actual.into()));
                    m.path = format!("{}.shape", name);
                    mismatches.push(m);
                }
                Ok(VerifyOutcome::DigestMismatch { expected, actual }) => {
                    let mut m = Mismatch::new(MismatchKind::DataMismatch, name, "content differs")
                        .values(Some(expected.into()), Some(actual.into()));
                    m.path = format!("{}.digest", name);
                    mismatches.push(m);
                }
                Err(e) => mismatches.push(Mismatch::new(
                    MismatchKind::DataMismatch,
                    name,
                    e.to_string(),
                )),
            }
        }
        checked
    }

    fn check_seeds(&self, bundle: &Bundle, mismatches: &mut Vec<Mismatch>) {
        let seeds = bundle.seeds();
        for (module, recorded) in &seeds.derived {
            let derived = derive_seed(seeds.master_seed, module);
            if derived != *recorded {
                let mut m = Mismatch::new(
                    MismatchKind::SeedMismatch,
                    module,
                    "recorded seed does not derive from the master seed",
                )
                .values(Some((*recorded).into()), Some(derived.into()));
                m.path = format!("{}.seed", module);
                mismatches.push(m);
            }
        }
    }

    fn replay_all(
        &self,
        bundle: &Bundle,
        fresh: &BTreeMap<String, Dataset>,
        hooks: &ReplayHooks,
        mismatches: &mut Vec<Mismatch>,
    ) -> Vec<String> {
        let mut replayed = Vec::new();
        if hooks.is_empty() {
            return replayed;
        }
        let data = Arc::new(fresh.clone());

        for (module, hook) in &hooks.hooks {
            let Some(stored) = bundle.result(module) else {
                mismatches.push(Mismatch::new(
                    MismatchKind::MissingResult,
                    module,
                    "bundle has no stored result for this module",
                ));
                continue;
            };

            let input = ReplayInput {
                module: module.clone(),
                seed: bundle.seeds().derive(module),
                data: Arc::clone(&data),
                parameters: bundle.last_inputs_for(module).cloned().unwrap_or(Value::Null),
            };
            match self.run_hook(module, Arc::clone(hook), input) {
                Ok(actual) => {
                    replayed.push(module.clone());
                    let before = mismatches.len();
                    compare_values(module, module, stored, &actual, &self.config, mismatches);
                    if mismatches.len() == before {
                        debug!(module = %module, "replay reproduced stored result");
                    }
                }
                Err(m) => mismatches.push(m),
            }
        }
        replayed
    }

    /// Run one hook on its own thread, waiting at most the configured timeout
    ///
    /// A hook that overruns is abandoned: its thread keeps running detached
    /// and its eventual output is discarded.
    fn run_hook(
        &self,
        module: &str,
        hook: Arc<dyn ReplayHook>,
        input: ReplayInput,
    ) -> std::result::Result<Value, Mismatch> {
        let (tx, rx) = channel::bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("replay-{}", module))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook.replay(&input)))
                    .map_err(|payload| panic_message(payload.as_ref()));
                // The receiver is gone if the replay timed out.
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Err(Mismatch::new(
                MismatchKind::ReplayFailed,
                module,
                format!("could not start replay thread: {}", e),
            ));
        }

        match rx.recv_timeout(self.config.replay_timeout()) {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(Mismatch::new(
                MismatchKind::ReplayFailed,
                module,
                format!("{:#}", e),
            )),
            Ok(Err(panic)) => Err(Mismatch::new(
                MismatchKind::ReplayFailed,
                module,
                format!("replay panicked: {}", panic),
            )),
            Err(RecvTimeoutError::Timeout) => Err(Mismatch::new(
                MismatchKind::ReplayTimeout,
                module,
                format!("replay exceeded {} ms", self.config.replay_timeout_ms),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(Mismatch::new(
                MismatchKind::ReplayFailed,
                module,
                "replay thread exited without a result",
            )),
        }
    }
}

/// Verify `bundle` against `fresh` data and `hooks`
pub fn verify(
    bundle: &Bundle,
    fresh: &BTreeMap<String, Dataset>,
    hooks: &ReplayHooks,
    config: &VerifyConfig,
) -> Result<VerificationResult> {
    Ok(Verifier::new(config.clone())?.verify(bundle, fresh, hooks))
}

/// Structural comparison: exact for everything but floats
fn compare_values(
    subject: &str,
    path: &str,
    expected: &Value,
    actual: &Value,
    config: &VerifyConfig,
    out: &mut Vec<Mismatch>,
) {
    let mismatch = |detail: String, delta: Option<f64>| Mismatch {
        kind: MismatchKind::ReplayMismatch,
        subject: subject.to_string(),
        path: path.to_string(),
        expected: Some(expected.clone()),
        actual: Some(actual.clone()),
        delta,
        detail,
    };

    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => {
            if e.is_f64() || a.is_f64() {
                let (ef, af) = (e.as_f64().unwrap_or(f64::NAN), a.as_f64().unwrap_or(f64::NAN));
                if !config.floats_match(ef, af) {
                    let delta = (ef - af).abs();
                    out.push(mismatch(format!("differs by {:e}", delta), Some(delta)));
                }
            } else if e != a {
                out.push(mismatch("integers differ".to_string(), None));
            }
        }
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                out.push(mismatch(
                    format!("length {} vs {}", e.len(), a.len()),
                    None,
                ));
                return;
            }
            for (i, (ev, av)) in e.iter().zip(a).enumerate() {
                compare_values(subject, &format!("{}[{}]", path, i), ev, av, config, out);
            }
        }
        (Value::Object(e), Value::Object(a)) => {
            let mut keys: Vec<&String> = e.keys().chain(a.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{}.{}", path, key);
                match (e.get(key), a.get(key)) {
                    (Some(ev), Some(av)) => compare_values(subject, &child, ev, av, config, out),
                    (ev, av) => out.push(Mismatch {
                        kind: MismatchKind::ReplayMismatch,
                        subject: subject.to_string(),
                        path: child,
                        expected: ev.cloned(),
                        actual: av.cloned(),
                        delta: None,
                        detail: if ev.is_none() {
                            "unexpected field".to_string()
                        } else {
                            "missing field".to_string()
                        },
                    }),
                }
            }
        }
        (e, a) if e == a => {}
        _ => out.push(mismatch("values differ".to_string(), None)),
    }
}
