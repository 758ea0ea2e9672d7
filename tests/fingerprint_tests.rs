//! Fingerprinting: idempotence, change detection and JSON ingestion

use reprobundle::dataset::{Column, ColumnData, Dataset, Layout, Matrix};
use reprobundle::fingerprint::{fingerprint, fingerprint_with_cancel, verify, VerifyOutcome};
use reprobundle::{CancellationToken, DataIntegrityKind, ReproError};
use serde_json::json;

mod utils;

#[test]
fn test_fingerprint_twice_is_identical() {
    let data = utils::trial_data();
    assert_eq!(fingerprint(&data).unwrap(), fingerprint(&data).unwrap());
}

#[test]
fn test_changed_cell_is_detected() {
    // D fingerprinted as F1, one cell changed, F2 != F1, verify(D, F1) reports the digest.
    let original = utils::trial_data();
    let f1 = fingerprint(&original).unwrap();

    let changed = Dataset::table(vec![
        Column::text("arm", vec!["control", "treatment", "control", "treatment"]),
        Column::float("score", vec![4.1, 5.3, 3.9, 5.9]),
        Column::int("age", vec![34, 51, 29, 46]),
    ])
    .unwrap();
    let f2 = fingerprint(&changed).unwrap();
    assert_ne!(f1.digest, f2.digest);
    assert_eq!(f1.shape, f2.shape);

    match verify(&changed, &f1).unwrap() {
        VerifyOutcome::DigestMismatch { expected, actual } => {
            assert_eq!(expected, f1.digest);
            assert_eq!(actual, f2.digest);
        }
        other => panic!("expected DigestMismatch, got {:?}", other),
    }
    assert!(verify(&original, &f1).unwrap().is_match());
}

#[test]
fn test_row_and_column_json_agree() {
    let rows = json!([
        {"score": 1.5, "group": "a"},
        {"score": 2.5, "group": "b"}
    ]);
    let columns = json!({
        "group": ["a", "b"],
        "score": [1.5, 2.5]
    });
    let a = fingerprint(&Dataset::from_json(&rows).unwrap()).unwrap();
    let b = fingerprint(&Dataset::from_json(&columns).unwrap()).unwrap();
    assert_eq!(a.digest, b.digest);
}

#[test]
fn test_matrix_layouts_agree() {
    let row_major = Matrix::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Layout::RowMajor)
        .unwrap();
    let col_major = Matrix::new(
        vec![2, 3],
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0],
        Layout::ColumnMajor,
    )
    .unwrap();
    assert_eq!(
        fingerprint(&Dataset::Matrix(row_major)).unwrap(),
        fingerprint(&Dataset::Matrix(col_major)).unwrap()
    );
}

#[test]
fn test_nulls_are_summarized() {
    let data = Dataset::table(vec![
        Column::new("x", ColumnData::Float(vec![Some(1.0), None, Some(f64::NAN)])),
        Column::new("y", ColumnData::Int(vec![None, Some(2), Some(3)])),
    ])
    .unwrap();
    let fp = fingerprint(&data).unwrap();
    assert_eq!(fp.null_pattern.total_nulls, 3);
    assert_eq!(
        fp.null_pattern.per_column,
        vec![("x".to_string(), 2), ("y".to_string(), 1)]
    );
}

#[test]
fn test_unsupported_and_ragged_input() {
    let nested = json!([{"a": {"nested": true}}]);
    let err = Dataset::from_json(&nested).unwrap_err();
    assert_eq!(err.integrity_kind(), Some(DataIntegrityKind::UnsupportedType));

    let ragged = Dataset::table(vec![
        Column::float("a", vec![1.0, 2.0]),
        Column::float("b", vec![1.0]),
    ])
    .unwrap_err();
    assert_eq!(ragged.integrity_kind(), Some(DataIntegrityKind::ShapeMismatch));

    let bad_matrix = Dataset::matrix(vec![2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
    assert_eq!(bad_matrix.integrity_kind(), Some(DataIntegrityKind::ShapeMismatch));
}

#[test]
fn test_cancellation_produces_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let err = fingerprint_with_cancel(&utils::trial_data(), &token).unwrap_err();
    assert!(matches!(err, ReproError::Cancelled(_)));
}
