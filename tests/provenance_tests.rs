//! Provenance recording: step ordering, step lifecycle and seeds

use reprobundle::pipeline::PipelineTracker;
use reprobundle::seed::{derive_seed, SeedManager};
use reprobundle::{ReproError, StepStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;

mod utils;

#[test]
fn test_end_step_twice_is_invalid_state() {
    let session = utils::new_session();
    let handle = session.begin_step("anova", "anova", &Value::Null).unwrap();
    session.end_step(&handle, &json!({"f": 4.2})).unwrap();

    let err = session.end_step(&handle, &json!({"f": 0.0})).unwrap_err();
    assert!(matches!(err, ReproError::InvalidState(_)));
    assert_eq!(session.steps()[0].output_snapshot, Some(json!({"f": 4.2})));
}

#[test]
fn test_concurrent_session_steps_are_strictly_ordered() {
    let session = Arc::new(utils::new_session());
    let workers: Vec<_> = (0..6)
        .map(|w| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for i in 0..40 {
                    session
                        .track(&format!("resample-{}-{}", w, i), "bootstrap", || {
                            Ok::<_, anyhow::Error>(i)
                        })
                        .unwrap();
                    if i % 10 == 0 {
                        session.record_decision(format!("checkpoint {}/{}", w, i), None).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let steps = session.steps();
    assert_eq!(steps.len(), 240);
    assert!(steps.windows(2).all(|p| p[0].sequence < p[1].sequence));
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    // Steps and decisions never share a sequence number.
    let decisions = session.decisions();
    assert_eq!(decisions.len(), 24);
    let mut all: Vec<u64> = steps
        .iter()
        .map(|s| s.sequence)
        .chain(decisions.iter().map(|d| d.sequence))
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 264);
}

#[test]
fn test_tracker_snapshot_is_consistent() {
    let tracker = PipelineTracker::new();
    let h = tracker.begin_step("load", "io", Value::Null);
    tracker.end_step(&h, json!({"rows": 120})).unwrap();
    tracker.record_decision("drop 3 incomplete rows", Some(&h)).unwrap();

    let log = tracker.snapshot();
    assert_eq!(log.steps.len(), 1);
    assert_eq!(log.decisions[0].related_step_sequence, Some(h.sequence()));
}

#[test]
fn test_seed_determinism_across_managers() {
    let a = SeedManager::new(Some(42)).unwrap();
    let b = SeedManager::new(Some(42)).unwrap();
    assert_eq!(a.derive("power_analysis"), b.derive("power_analysis"));
    assert_ne!(a.derive("numpy"), a.derive("scipy"));
    assert_eq!(a.derive("numpy"), derive_seed(42, "numpy"));
}

#[test]
fn test_session_records_derived_seeds() {
    let session = utils::new_session();
    let seed = session.derive_seed("bootstrap").unwrap();
    let seeds = session.seeds();
    assert_eq!(seeds.master_seed, utils::MASTER_SEED);
    assert_eq!(seeds.derived["bootstrap"], seed);
}

#[test]
fn test_unseeded_session_generates_master_seed() {
    let a = reprobundle::create_session(None).unwrap();
    let b = reprobundle::create_session(None).unwrap();
    assert!(a.master_seed() <= reprobundle::seed::MAX_MASTER_SEED);
    // Two fresh 63-bit draws colliding would indicate a broken generator.
    assert_ne!(a.master_seed(), b.master_seed());
}

#[test]
fn test_out_of_range_master_seed_is_invalid_seed() {
    let err = reprobundle::create_session(Some(u64::MAX)).unwrap_err();
    assert!(matches!(err, ReproError::InvalidSeed(_)), "{:?}", err);

    let max = reprobundle::create_session(Some(reprobundle::seed::MAX_MASTER_SEED)).unwrap();
    assert_eq!(max.master_seed(), reprobundle::seed::MAX_MASTER_SEED);
}
