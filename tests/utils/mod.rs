// Integration test utilities
//
// A small but complete analysis session shared by the integration tests.

#![allow(dead_code)]

use reprobundle::{
    Bundle, Column, Dataset, ModuleStateSnapshot, ReplayHooks, ReplayInput, Session,
    SessionSettings,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const MASTER_SEED: u64 = 42;

/// Two-arm trial table used as the analysis input
pub fn trial_data() -> Dataset {
    Dataset::table(vec![
        Column::text("arm", vec!["control", "treatment", "control", "treatment"]),
        Column::float("score", vec![4.1, 5.3, 3.9, 5.8]),
        Column::int("age", vec![34, 51, 29, 46]),
    ])
    .unwrap()
}

pub fn fresh_data() -> BTreeMap<String, Dataset> {
    let mut fresh = BTreeMap::new();
    fresh.insert("trial".to_string(), trial_data());
    fresh
}

pub fn new_session() -> Session {
    Session::new(
        &SessionSettings::default()
            .with_master_seed(MASTER_SEED)
            .with_creator("integration")
            .with_description("two-arm pilot"),
    )
    .unwrap()
}

/// Session with data, a tracked step, a decision, seeds, results and one
/// failing state provider
pub fn recorded_session(stored_pi: f64) -> Session {
    let session = new_session();
    session.fingerprint("trial", &trial_data()).unwrap();
    session.set_parameter("alpha", &0.05).unwrap();
    session.derive_seed("bootstrap").unwrap();

    let handle = session
        .begin_step("normality", "shapiro", &json!({"column": "score"}))
        .unwrap();
    session.end_step(&handle, &json!({"w": 0.97})).unwrap();
    session
        .record_decision("residuals look normal, keep Welch t-test", Some(&handle))
        .unwrap();

    session
        .track("estimate_pi", "estimator", || -> anyhow::Result<f64> {
            Ok(stored_pi)
        })
        .unwrap();
    session.record_result("estimator", &stored_pi).unwrap();
    session
        .record_result("t_test", &json!({"t": 2.31, "df": 2, "significant": false}))
        .unwrap();

    session
        .register_state_provider("t_test", || -> anyhow::Result<ModuleStateSnapshot> {
            Ok(ModuleStateSnapshot::new(1, json!({"equal_var": false})))
        })
        .unwrap();
    session
        .register_state_provider("effect_sizes", || -> anyhow::Result<ModuleStateSnapshot> {
            Err(anyhow::anyhow!("effect sizes were never computed"))
        })
        .unwrap();
    session
}

pub fn frozen_bundle() -> Bundle {
    recorded_session(3.14159265358979).freeze().unwrap()
}

/// Hooks that reproduce `recorded_session` with `replayed_pi` as the estimate
pub fn hooks(replayed_pi: f64) -> ReplayHooks {
    ReplayHooks::new()
        .with("estimator", move |_: &ReplayInput| -> anyhow::Result<Value> {
            Ok(json!(replayed_pi))
        })
        .unwrap()
        .with("t_test", |input: &ReplayInput| -> anyhow::Result<Value> {
            anyhow::ensure!(input.dataset("trial").is_some(), "trial data missing");
            Ok(json!({"t": 2.31, "df": 2, "significant": false}))
        })
        .unwrap()
}
