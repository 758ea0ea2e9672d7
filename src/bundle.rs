//! The frozen, checksum-protected record of one analysis session
//!
//! A [`Bundle`] is only ever produced by [`Session::freeze`](crate::Session::freeze)
//! or by the importer, and both paths go through [`Bundle::seal`] or
//! [`Bundle::verified`]. Fields are private and there are no mutators, so a
//! bundle that exists has a checksum that matches its content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::canonical::canonical_digest;
use crate::environment::EnvironmentInfo;
use crate::error::{ReproError, Result};
use crate::fingerprint::Fingerprint;
use crate::names::validate_name;
use crate::pipeline::{DecisionPoint, PipelineStep};
use crate::seed::SeedSet;
use crate::state_capture::{CaptureFailure, ModuleStateSnapshot};

/// Everything the checksum covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BundleBody {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    pub description: String,
    pub fingerprints: BTreeMap<String, Fingerprint>,
    pub steps: Vec<PipelineStep>,
    pub decisions: Vec<DecisionPoint>,
    pub seeds: SeedSet,
    pub module_states: BTreeMap<String, ModuleStateSnapshot>,
    pub capture_errors: Vec<CaptureFailure>,
    pub environment: EnvironmentInfo,
    pub results: BTreeMap<String, Value>,
    pub methods_text: String,
}

impl BundleBody {
    pub fn checksum(&self) -> Result<String> {
        canonical_digest(self)
    }
}

/// Immutable reproducibility bundle
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    body: BundleBody,
    checksum: String,
}

impl Bundle {
    /// Compute the checksum and wrap `body`
    pub(crate) fn seal(body: BundleBody) -> Result<Self> {
        let checksum = body.checksum()?;
        Ok(Self { body, checksum })
    }

    /// Wrap a loaded `body` only if it matches `stored_checksum`
    ///
    /// A matching checksum proves the content is intact, not that it was
    /// written by a session, so every name that can become a container path
    /// is checked as well.
    pub(crate) fn verified(body: BundleBody, stored_checksum: &str) -> Result<Self> {
        check_names(&body)?;
        let recomputed = body.checksum()?;
        if recomputed != stored_checksum {
            return Err(ReproError::CorruptBundle(format!(
                "checksum mismatch: stored {}, recomputed {}",
                stored_checksum, recomputed
            )));
        }
        Ok(Self {
            body,
            checksum: recomputed,
        })
    }

    pub(crate) fn body(&self) -> &BundleBody {
        &self.body
    }

    pub fn id(&self) -> Uuid {
        self.body.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.body.created_at
    }

    pub fn creator(&self) -> &str {
        &self.body.creator
    }

    pub fn description(&self) -> &str {
        &self.body.description
    }

    pub fn fingerprints(&self) -> &BTreeMap<String, Fingerprint> {
        &self.body.fingerprints
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.body.steps
    }

    pub fn decisions(&self) -> &[DecisionPoint] {
        &self.body.decisions
    }

    pub fn seeds(&self) -> &SeedSet {
        &self.body.seeds
    }

    pub fn module_states(&self) -> &BTreeMap<String, ModuleStateSnapshot> {
        &self.body.module_states
    }

    pub fn capture_errors(&self) -> &[CaptureFailure] {
        &self.body.capture_errors
    }

    pub fn environment(&self) -> &EnvironmentInfo {
        &self.body.environment
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.body.results
    }

    pub fn result(&self, module: &str) -> Option<&Value> {
        self.body.results.get(module)
    }

    pub fn methods_text(&self) -> &str {
        &self.body.methods_text
    }

    /// Stored checksum (lowercase hex SHA-256)
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Recompute the checksum from the content
    pub fn recompute_checksum(&self) -> Result<String> {
        self.body.checksum()
    }

    /// Inputs of the most recent step recorded for `module`
    pub fn last_inputs_for(&self, module: &str) -> Option<&Value> {
        self.body
            .steps
            .iter()
            .rev()
            .find(|s| s.module == module)
            .map(|s| &s.input_snapshot)
    }

    /// Generate a status line for bundle information
    pub fn summary_line(&self) -> String {
        format!(
            "bundle {}: {} datasets, {} steps, {} decisions, {} module states ({} capture errors), checksum {}",
            self.body.id,
            self.body.fingerprints.len(),
            self.body.steps.len(),
            self.body.decisions.len(),
            self.body.module_states.len(),
            self.body.capture_errors.len(),
            &self.checksum[..12.min(self.checksum.len())]
        )
    }
}

fn check_names(body: &BundleBody) -> Result<()> {
    let names = [
        ("fingerprints", body.fingerprints.keys().collect::<Vec<_>>()),
        ("results", body.results.keys().collect()),
        ("module_states", body.module_states.keys().collect()),
        ("seeds", body.seeds.derived.keys().collect()),
    ];
    for (section, keys) in names {
        for key in keys {
            validate_name(key)
                .map_err(|e| ReproError::CorruptBundle(format!("{}: {}", section, e)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::dataset::{Column, Dataset};
    use crate::fingerprint::fingerprint;
    use crate::pipeline::StepStatus;
    use serde_json::json;

    /// A small but fully populated body
    pub(crate) fn sample_body() -> BundleBody {
        let created_at = DateTime::parse_from_rfc3339("2026-03-14T09:26:53.589793Z")
            .unwrap()
            .with_timezone(&Utc);
        let data = Dataset::table(vec![
            Column::float("score", vec![1.5, 2.5, 3.5]),
            Column::text("group", vec!["a", "b", "a"]),
        ])
        .unwrap();

        let mut fingerprints = BTreeMap::new();
        fingerprints.insert("trial".to_string(), fingerprint(&data).unwrap());

        let mut derived = BTreeMap::new();
        derived.insert(
            "power_analysis".to_string(),
            crate::seed::derive_seed(42, "power_analysis"),
        );

        let mut module_states = BTreeMap::new();
        module_states.insert(
            "power_analysis".to_string(),
            ModuleStateSnapshot::new(1, json!({"effect_size": 0.5})),
        );

        let mut results = BTreeMap::new();
        results.insert("power_analysis".to_string(), json!({"power": 0.8017, "n": 64}));

        BundleBody {
            id: Uuid::parse_str("6f1c8e4a-2b1d-4c6e-9a57-3d2f1e0b9c88").unwrap(),
            created_at,
            creator: "j.doe".to_string(),
            description: "pilot power analysis".to_string(),
            fingerprints,
            steps: vec![PipelineStep {
                sequence: 0,
                name: "compute_power".to_string(),
                module: "power_analysis".to_string(),
                started_at: created_at,
                ended_at: Some(created_at),
                status: StepStatus::Completed,
                input_snapshot: json!({"alpha": 0.05}),
                output_snapshot: Some(json!({"power": 0.8017})),
            }],
            decisions: vec![DecisionPoint {
                sequence: 1,
                rationale: "two-sided test per protocol".to_string(),
                related_step_sequence: Some(0),
                recorded_at: created_at,
            }],
            seeds: SeedSet {
                master_seed: 42,
                derived,
            },
            module_states,
            capture_errors: vec![CaptureFailure {
                module: "effect_sizes".to_string(),
                error: "not fitted".to_string(),
            }],
            environment: EnvironmentInfo::capture(),
            results,
            methods_text: "## Methods\n".to_string(),
        }
    }
}
