//! Append-only log of analysis steps and decision points
//!
//! Steps and decisions draw their sequence numbers from one session-wide
//! counter behind a single lock, so the log is a strict total order even
//! when the statistical work runs on many threads. Entries are never edited
//! once closed and never removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{ReproError, Result};

/// Lifecycle of a recorded step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Open,
    Completed,
    Failed { error: String },
}

/// One recorded unit of analysis work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub sequence: u64,
    pub name: String,
    pub module: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StepStatus,
    pub input_snapshot: Value,
    pub output_snapshot: Option<Value>,
}

impl PipelineStep {
    /// Wall-clock duration in milliseconds, once the step is closed
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Recorded rationale for a choice made during analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub sequence: u64,
    pub rationale: String,
    pub related_step_sequence: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// Steps and decisions as stored in a bundle (`pipeline.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineLog {
    pub steps: Vec<PipelineStep>,
    pub decisions: Vec<DecisionPoint>,
}

/// Handle to an open step
///
/// Copyable so a caller holding it twice gets `InvalidState` on the second
/// close rather than a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHandle {
    sequence: u64,
}

impl StepHandle {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    next_sequence: u64,
    parameters: BTreeMap<String, Value>,
    steps: BTreeMap<u64, PipelineStep>,
    decisions: Vec<DecisionPoint>,
}

impl TrackerState {
    fn next(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

/// Thread-safe, linearized provenance log
#[derive(Debug, Default)]
pub struct PipelineTracker {
    state: Mutex<TrackerState>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a currently known input parameter; later steps snapshot it
    pub fn set_parameter(&self, key: impl Into<String>, value: Value) {
        self.lock().parameters.insert(key.into(), value);
    }

    /// Open a step, snapshotting the known parameters merged with `inputs`
    ///
    /// Object `inputs` are merged key by key over the parameters. Any other
    /// value is stored under the `"inputs"` key.
    pub fn begin_step(&self, name: &str, module: &str, inputs: Value) -> StepHandle {
        let mut state = self.lock();
        let mut snapshot: Map<String, Value> = state
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match inputs {
            Value::Object(map) => snapshot.extend(map),
            Value::Null => {}
            other => {
                snapshot.insert("inputs".to_string(), other);
            }
        }

        let sequence = state.next();
        state.steps.insert(
            sequence,
            PipelineStep {
                sequence,
                name: name.to_string(),
                module: module.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                status: StepStatus::Open,
                input_snapshot: Value::Object(snapshot),
                output_snapshot: None,
            },
        );
        debug!(sequence, step = name, module, "step opened");
        StepHandle { sequence }
    }

    /// Close a step successfully with its outputs
    ///
    /// A `null` output is stored as no output, so the step reads back the
    /// same after a JSON round trip.
    pub fn end_step(&self, handle: &StepHandle, outputs: Value) -> Result<()> {
        let outputs = Some(outputs).filter(|v| !v.is_null());
        self.close(handle, StepStatus::Completed, outputs)
    }

    /// Close a step as failed
    pub fn fail_step(&self, handle: &StepHandle, error: impl Into<String>) -> Result<()> {
        self.close(
            handle,
            StepStatus::Failed {
                error: error.into(),
            },
            None,
        )
    }

    fn close(&self, handle: &StepHandle, status: StepStatus, outputs: Option<Value>) -> Result<()> {
        let mut state = self.lock();
        let step = state.steps.get_mut(&handle.sequence).ok_or_else(|| {
            ReproError::InvalidState(format!("no step with sequence {}", handle.sequence))
        })?;
        if step.status != StepStatus::Open {
            return Err(ReproError::InvalidState(format!(
                "step '{}' (sequence {}) is already closed",
                step.name, step.sequence
            )));
        }

        step.ended_at = Some(Utc::now());
        step.output_snapshot = outputs;
        if let StepStatus::Failed { error } = &status {
            warn!(sequence = step.sequence, step = %step.name, error = %error, "step failed");
        } else {
            debug!(sequence = step.sequence, step = %step.name, "step closed");
        }
        step.status = status;
        Ok(())
    }

    /// Append a decision, optionally tied to a step
    pub fn record_decision(
        &self,
        rationale: impl Into<String>,
        related_step: Option<&StepHandle>,
    ) -> Result<u64> {
        let mut state = self.lock();
        if let Some(handle) = related_step {
            if !state.steps.contains_key(&handle.sequence) {
                return Err(ReproError::InvalidState(format!(
                    "decision references unknown step {}",
                    handle.sequence
                )));
            }
        }
        let sequence = state.next();
        state.decisions.push(DecisionPoint {
            sequence,
            rationale: rationale.into(),
            related_step_sequence: related_step.map(|h| h.sequence),
            recorded_at: Utc::now(),
        });
        Ok(sequence)
    }

    /// Steps in strictly increasing sequence order
    pub fn steps(&self) -> Vec<PipelineStep> {
        self.lock().steps.values().cloned().collect()
    }

    /// Decisions in strictly increasing sequence order
    pub fn decisions(&self) -> Vec<DecisionPoint> {
        self.lock().decisions.clone()
    }

    /// Sequence numbers of steps that have not been closed
    pub fn open_steps(&self) -> Vec<u64> {
        self.lock()
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Open)
            .map(|s| s.sequence)
            .collect()
    }

    /// Consistent snapshot of the whole log
    pub fn snapshot(&self) -> PipelineLog {
        let state = self.lock();
        PipelineLog {
            steps: state.steps.values().cloned().collect(),
            decisions: state.decisions.clone(),
        }
    }

    /// Inputs of the most recent step recorded for `module`
    pub fn last_inputs_for(&self, module: &str) -> Option<Value> {
        self.lock()
            .steps
            .values()
            .rev()
            .find(|s| s.module == module)
            .map(|s| s.input_snapshot.clone())
    }
}
