//! An open analysis session and its freeze into a [`Bundle`]
//!
//! A session owns the seed manager, pipeline tracker, state-capture registry,
//! recorded fingerprints and results of one analysis. Everything is
//! append-only while the session is open. [`Session::freeze`] assembles the
//! immutable bundle once; from then on every mutating call fails with
//! `InvalidState` and `freeze` returns the cached bundle.
//!
//! The session is `Sync`: statistical work may run on many threads and
//! record through a shared `&Session`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::{Bundle, BundleBody};
use crate::cancel::CancellationToken;
use crate::config::SessionSettings;
use crate::dataset::Dataset;
use crate::environment::EnvironmentInfo;
use crate::error::{ReproError, Result};
use crate::fingerprint::{fingerprint_with_cancel, Fingerprint};
use crate::methods;
use crate::names::validate_name;
use crate::pipeline::{DecisionPoint, PipelineStep, PipelineTracker, StepHandle};
use crate::seed::{self, SeedManager, SeedSet};
use crate::state_capture::{panic_message, StateCapture, StateProvider};

/// Open, append-only record of one analysis
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    creator: String,
    description: String,
    environment: EnvironmentInfo,
    seeds: SeedManager,
    pipeline: PipelineTracker,
    states: StateCapture,
    fingerprints: Mutex<BTreeMap<String, Fingerprint>>,
    results: Mutex<BTreeMap<String, Value>>,
    /// `Some` once frozen; held for the whole freeze
    frozen: Mutex<Option<Bundle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl Session {
    /// Start a session
    pub fn new(settings: &SessionSettings) -> Result<Self> {
        settings.validate()?;
        let seeds = SeedManager::new(settings.master_seed)?;
        let session = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            creator: settings.creator.clone(),
            description: settings.description.clone(),
            environment: EnvironmentInfo::capture(),
            seeds,
            pipeline: PipelineTracker::new(),
            states: StateCapture::new(),
            fingerprints: Mutex::new(BTreeMap::new()),
            results: Mutex::new(BTreeMap::new()),
            frozen: Mutex::new(None),
        };
        info!(
            session = %session.id,
            master_seed = session.seeds.master_seed(),
            "session created"
        );
        Ok(session)
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the captured environment, e.g. to add library versions
    pub fn with_environment(mut self, environment: EnvironmentInfo) -> Self {
        self.environment = environment;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn master_seed(&self) -> u64 {
        self.seeds.master_seed()
    }

    pub fn seeds(&self) -> SeedSet {
        self.seeds.seed_set()
    }

    pub fn environment(&self) -> &EnvironmentInfo {
        &self.environment
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.frozen).is_some()
    }

    /// Guard proving the session is open; mutations hold it so they cannot
    /// interleave with a freeze
    fn open_guard(&self, action: &str) -> Result<MutexGuard<'_, Option<Bundle>>> {
        let guard = lock(&self.frozen);
        if guard.is_some() {
            return Err(ReproError::InvalidState(format!(
                "cannot {}: session {} is frozen",
                action, self.id
            )));
        }
        Ok(guard)
    }

    // ------------------------------------------------------------------
    // Data and seeds
    // ------------------------------------------------------------------

    /// Fingerprint `dataset` and record it under `name`
    ///
    /// Recording the same content twice is a no-op. Recording different
    /// content under an existing name is `InvalidState`.
    pub fn fingerprint(&self, name: &str, dataset: &Dataset) -> Result<Fingerprint> {
        self.fingerprint_with_cancel(name, dataset, &CancellationToken::new())
    }

    pub fn fingerprint_with_cancel(
        &self,
        name: &str,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint> {
        validate_name(name)?;
        let fp = fingerprint_with_cancel(dataset, cancel)?;

        let _open = self.open_guard("record a fingerprint")?;
        let mut fingerprints = lock(&self.fingerprints);
        if let Some(existing) = fingerprints.get(name) {
            if existing.digest != fp.digest {
                return Err(ReproError::InvalidState(format!(
                    "dataset '{}' already recorded with digest {}",
                    name,
                    existing.short_digest()
                )));
            }
            return Ok(fp);
        }
        debug!(dataset = name, digest = fp.short_digest(), "dataset fingerprinted");
        fingerprints.insert(name.to_string(), fp.clone());
        Ok(fp)
    }

    pub fn fingerprints(&self) -> BTreeMap<String, Fingerprint> {
        lock(&self.fingerprints).clone()
    }

    /// Derive and record the seed for `module`
    pub fn derive_seed(&self, module: &str) -> Result<u64> {
        validate_name(module)?;
        let _open = self.open_guard("derive a seed")?;
        Ok(self.seeds.derive(module))
    }

    /// Run `f` with the ambient RNG seeded for `module`
    pub fn with_seeded_scope<T>(&self, module: &str, f: impl FnOnce() -> T) -> Result<T> {
        let seed = self.derive_seed(module)?;
        seed::with_scope(seed, f)
    }

    // ------------------------------------------------------------------
    // Provenance
    // ------------------------------------------------------------------

    /// Record an input parameter picked up by every later step
    pub fn set_parameter<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = to_json(value)?;
        let _open = self.open_guard("set a parameter")?;
        self.pipeline.set_parameter(key, value);
        Ok(())
    }

    pub fn begin_step<T: Serialize + ?Sized>(
        &self,
        name: &str,
        module: &str,
        inputs: &T,
    ) -> Result<StepHandle> {
        validate_name(module)?;
        let inputs = to_json(inputs)?;
        let _open = self.open_guard("begin a step")?;
        Ok(self.pipeline.begin_step(name, module, inputs))
    }

    pub fn end_step<T: Serialize + ?Sized>(&self, handle: &StepHandle, outputs: &T) -> Result<()> {
        let outputs = to_json(outputs)?;
        let _open = self.open_guard("end a step")?;
        self.pipeline.end_step(handle, outputs)
    }

    pub fn fail_step(&self, handle: &StepHandle, error: impl Into<String>) -> Result<()> {
        let _open = self.open_guard("fail a step")?;
        self.pipeline.fail_step(handle, error)
    }

    pub fn record_decision(
        &self,
        rationale: impl Into<String>,
        related_step: Option<&StepHandle>,
    ) -> Result<u64> {
        let _open = self.open_guard("record a decision")?;
        self.pipeline.record_decision(rationale, related_step)
    }

    /// Run `f` as a recorded step of `module`
    ///
    /// The step is closed with `f`'s output on success and as failed on
    /// error. A panic in `f` also closes the step as failed, then resumes
    /// unwinding.
    pub fn track<T, F>(&self, name: &str, module: &str, f: F) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> anyhow::Result<T>,
    {
        self.track_with_inputs(name, module, &Value::Null, f)
    }

    /// [`track`](Self::track) with explicit step inputs
    pub fn track_with_inputs<I, T, F>(
        &self,
        name: &str,
        module: &str,
        inputs: &I,
        f: F,
    ) -> Result<T>
    where
        I: Serialize + ?Sized,
        T: Serialize,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let handle = self.begin_step(name, module, inputs)?;

        // A step stays open until closed here, so freeze cannot run in between
        // and the tracker can be used directly.
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => match serde_json::to_value(&value) {
                Ok(outputs) => {
                    self.pipeline.end_step(&handle, outputs)?;
                    Ok(value)
                }
                Err(e) => {
                    self.pipeline
                        .fail_step(&handle, format!("output not serializable: {}", e))?;
                    Err(e.into())
                }
            },
            Ok(Err(source)) => {
                self.pipeline.fail_step(&handle, format!("{:#}", source))?;
                Err(ReproError::StepFailed {
                    step: name.to_string(),
                    source,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if let Err(e) = self
                    .pipeline
                    .fail_step(&handle, format!("panicked: {}", message))
                {
                    warn!(step = name, error = %e, "could not close panicked step");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    pub fn steps(&self) -> Vec<PipelineStep> {
        self.pipeline.steps()
    }

    pub fn decisions(&self) -> Vec<DecisionPoint> {
        self.pipeline.decisions()
    }

    // ------------------------------------------------------------------
    // Results and module state
    // ------------------------------------------------------------------

    /// Register the state provider for `module`
    pub fn register_state_provider(
        &self,
        module: &str,
        provider: impl StateProvider + 'static,
    ) -> Result<()> {
        let _open = self.open_guard("register a state provider")?;
        self.states.register(module, provider)
    }

    /// Record the final result of `module`; a later call replaces it
    pub fn record_result<T: Serialize + ?Sized>(&self, module: &str, result: &T) -> Result<()> {
        validate_name(module)?;
        let value = to_json(result)?;
        let _open = self.open_guard("record a result")?;
        if lock(&self.results).insert(module.to_string(), value).is_some() {
            debug!(module, "result replaced");
        }
        Ok(())
    }

    pub fn results(&self) -> BTreeMap<String, Value> {
        lock(&self.results).clone()
    }

    // ------------------------------------------------------------------
    // Freeze
    // ------------------------------------------------------------------

    /// Freeze the session into an immutable bundle
    ///
    /// State providers are called during the freeze and must not call back
    /// into this session.
    pub fn freeze(&self) -> Result<Bundle> {
        self.freeze_with_cancel(&CancellationToken::new())
    }

    /// Freeze, giving up (and leaving the session open) if `cancel` fires
    pub fn freeze_with_cancel(&self, cancel: &CancellationToken) -> Result<Bundle> {
        let mut frozen = lock(&self.frozen);
        if let Some(bundle) = frozen.as_ref() {
            return Ok(bundle.clone());
        }

        cancel.check("freeze")?;
        let open = self.pipeline.open_steps();
        if !open.is_empty() {
            return Err(ReproError::InvalidState(format!(
                "cannot freeze with unfinished steps {:?}",
                open
            )));
        }

        let log = self.pipeline.snapshot();
        let (module_states, capture_errors) = self.states.capture_all();
        cancel.check("freeze")?;

        let mut body = BundleBody {
            id: self.id,
            created_at: self.created_at,
            creator: self.creator.clone(),
            description: self.description.clone(),
            fingerprints: self.fingerprints(),
            steps: log.steps,
            decisions: log.decisions,
            seeds: self.seeds.seed_set(),
            module_states,
            capture_errors,
            environment: self.environment.clone(),
            results: self.results(),
            methods_text: String::new(),
        };
        body.methods_text = methods::render(&body);
        cancel.check("freeze")?;

        let bundle = Bundle::seal(body)?;
        if !bundle.capture_errors().is_empty() {
            warn!(
                session = %self.id,
                failures = bundle.capture_errors().len(),
                "bundle frozen with incomplete module state"
            );
        }
        info!(session = %self.id, checksum = bundle.checksum(), "session frozen");
        *frozen = Some(bundle.clone());
        Ok(bundle)
    }
}
