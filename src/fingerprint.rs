//! Content-addressed dataset fingerprints
//!
//! A fingerprint is the SHA-256 digest of a canonical byte encoding of a
//! [`Dataset`] plus shape, element-type and null-pattern metadata. The encoding
//! is independent of how the data sits in memory:
//!
//! ```text
//! "reprobundle-fp-v1" | kind | shape | (name, type)* | cell*   (row-major)
//!
//! cell  := 0x00                          null (None or NaN)
//!        | 0x01 hex16(f64 bits)          float, -0.0 folded to 0.0
//!        | 0x02 hex16(i64 bits)          int
//!        | 0x03 '0' | '1'                bool
//!        | 0x04 len(u64 LE) utf8         text
//! ```
//!
//! Only the digest is a tamper check. Metadata exists to explain *why* two
//! datasets differ.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::dataset::{Column, ColumnData, ColumnType, Dataset};
use crate::error::{ReproError, Result};

/// Version tag mixed into every fingerprint; bump when the encoding changes
pub const FINGERPRINT_VERSION: &str = "reprobundle-fp-v1";

/// Hash algorithm name recorded on fingerprints
pub const FINGERPRINT_ALGORITHM: &str = "SHA-256";

/// Cells between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 4096;

const TAG_NULL: u8 = 0x00;
const TAG_FLOAT: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;

/// Element type of one column (or the whole matrix)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementType {
    pub name: String,
    pub dtype: ColumnType,
}

/// Where the missing values are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NullPattern {
    pub total_nulls: usize,
    /// `(column, null count)` in column order
    pub per_column: Vec<(String, usize)>,
}

/// Content hash + metadata identifying a dataset's exact content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: String,
    /// Lowercase hex SHA-256 digest (64 characters)
    pub digest: String,
    pub shape: Vec<usize>,
    pub element_types: Vec<ElementType>,
    pub null_pattern: NullPattern,
}

impl Fingerprint {
    /// First 12 hex digits, for log lines and methods text
    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

/// Result of re-checking a dataset against a stored fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DigestMismatch {
        expected: String,
        actual: String,
    },
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, VerifyOutcome::Match)
    }
}

/// Fingerprint a dataset
pub fn fingerprint(dataset: &Dataset) -> Result<Fingerprint> {
    fingerprint_with_cancel(dataset, &CancellationToken::new())
}

/// Fingerprint a dataset, checking `cancel` every few thousand cells
pub fn fingerprint_with_cancel(
    dataset: &Dataset,
    cancel: &CancellationToken,
) -> Result<Fingerprint> {
    dataset.validate()?;
    let shape = dataset.shape();
    let mut hasher = Sha256::new();

    write_str(&mut hasher, FINGERPRINT_VERSION);
    write_str(&mut hasher, dataset.kind());
    hasher.update((shape.len() as u64).to_le_bytes());
    for dim in &shape {
        hasher.update((*dim as u64).to_le_bytes());
    }

    let (element_types, null_pattern) = match dataset {
        Dataset::Table(columns) => {
            hash_header(&mut hasher, columns);
            let rows = shape[0];
            for row in 0..rows {
                if row % CANCEL_CHECK_INTERVAL == 0 {
                    cancel.check("fingerprint")?;
                }
                for column in columns {
                    hash_cell(&mut hasher, column, row);
                }
            }
            summarize(columns)
        }
        Dataset::Series(column) => {
            let columns = std::slice::from_ref(column);
            hash_header(&mut hasher, columns);
            for row in 0..column.len() {
                if row % CANCEL_CHECK_INTERVAL == 0 {
                    cancel.check("fingerprint")?;
                }
                hash_cell(&mut hasher, column, row);
            }
            summarize(columns)
        }
        Dataset::Matrix(matrix) => {
            write_str(&mut hasher, "values");
            write_str(&mut hasher, ColumnType::Float.as_str());
            for index in 0..matrix.len() {
                if index % CANCEL_CHECK_INTERVAL == 0 {
                    cancel.check("fingerprint")?;
                }
                hash_float(&mut hasher, Some(matrix.value_row_major(index)));
            }
            let nulls = matrix.null_count();
            (
                vec![ElementType {
                    name: "values".to_string(),
                    dtype: ColumnType::Float,
                }],
                NullPattern {
                    total_nulls: nulls,
                    per_column: vec![("values".to_string(), nulls)],
                },
            )
        }
    };

    let digest = hex::encode(hasher.finalize());
    debug!(
        kind = dataset.kind(),
        shape = ?shape,
        digest = &digest[..12],
        "fingerprinted dataset"
    );

    Ok(Fingerprint {
        algorithm: FINGERPRINT_ALGORITHM.to_string(),
        digest,
        shape,
        element_types,
        null_pattern,
    })
}

/// Recompute the fingerprint of `dataset` and compare it with `expected`
///
/// Shape is compared first so the outcome says *how* the data changed. A
/// fingerprint produced by an unknown algorithm cannot be checked and is an
/// error rather than a mismatch.
pub fn verify(dataset: &Dataset, expected: &Fingerprint) -> Result<VerifyOutcome> {
    if expected.algorithm != FINGERPRINT_ALGORITHM {
        return Err(ReproError::unsupported(format!(
            "fingerprint algorithm '{}' is not supported",
            expected.algorithm
        )));
    }

    let actual = fingerprint(dataset)?;
    if actual.shape != expected.shape {
        return Ok(VerifyOutcome::ShapeMismatch {
            expected: expected.shape.clone(),
            actual: actual.shape,
        });
    }
    if actual.digest != expected.digest {
        return Ok(VerifyOutcome::DigestMismatch {
            expected: expected.digest.clone(),
            actual: actual.digest,
        });
    }
    Ok(VerifyOutcome::Match)
}

fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_header(hasher: &mut Sha256, columns: &[Column]) {
    for column in columns {
        write_str(hasher, &column.name);
        write_str(hasher, column.dtype().as_str());
    }
}

fn hash_float(hasher: &mut Sha256, value: Option<f64>) {
    match value {
        Some(v) if !v.is_nan() => {
            let v = if v == 0.0 { 0.0 } else { v };
            hasher.update([TAG_FLOAT]);
            hasher.update(format!("{:016x}", v.to_bits()).as_bytes());
        }
        _ => hasher.update([TAG_NULL]),
    }
}

fn hash_cell(hasher: &mut Sha256, column: &Column, row: usize) {
    match &column.data {
        ColumnData::Float(values) => hash_float(hasher, values[row]),
        ColumnData::Int(values) => match values[row] {
            Some(v) => {
                hasher.update([TAG_INT]);
                hasher.update(format!("{:016x}", v as u64).as_bytes());
            }
            None => hasher.update([TAG_NULL]),
        },
        ColumnData::Bool(values) => match values[row] {
            Some(v) => hasher.update([TAG_BOOL, if v { b'1' } else { b'0' }]),
            None => hasher.update([TAG_NULL]),
        },
        ColumnData::Text(values) => match &values[row] {
            Some(v) => {
                hasher.update([TAG_TEXT]);
                write_str(hasher, v);
            }
            None => hasher.update([TAG_NULL]),
        },
    }
}

fn summarize(columns: &[Column]) -> (Vec<ElementType>, NullPattern) {
    let element_types = columns
        .iter()
        .map(|c| ElementType {
            name: c.name.clone(),
            dtype: c.dtype(),
        })
        .collect();
    let per_column: Vec<(String, usize)> = columns
        .iter()
        .map(|c| (c.name.clone(), c.null_count()))
        .collect();
    let total_nulls = per_column.iter().map(|(_, n)| n).sum();
    (
        element_types,
        NullPattern {
            total_nulls,
            per_column,
        },
    )
}
