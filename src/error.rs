//! Error taxonomy for bundle recording, persistence and verification
//!
//! Failures that abort an operation are [`ReproError`] variants. Failures that
//! are an expected outcome of the analysis are *data* instead:
//! - a module whose state provider errored is a
//!   [`CaptureFailure`](crate::state_capture::CaptureFailure) on the bundle
//! - a discrepancy found during verification is a
//!   [`Mismatch`](crate::verifier::Mismatch) in the report

use std::fmt;
use thiserror::Error;

/// Sub-kind of a [`ReproError::DataIntegrity`] failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataIntegrityKind {
    /// Input cannot be represented as a fingerprintable dataset
    UnsupportedType,
    /// Declared shape does not match the data (ragged table, bad matrix shape)
    ShapeMismatch,
    /// Content hash differs from the expected digest
    DigestMismatch,
}

impl fmt::Display for DataIntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataIntegrityKind::UnsupportedType => "unsupported type",
            DataIntegrityKind::ShapeMismatch => "shape mismatch",
            DataIntegrityKind::DigestMismatch => "digest mismatch",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while recording, freezing, exporting or importing a bundle
#[derive(Error, Debug)]
pub enum ReproError {
    #[error("Data integrity error ({kind}): {detail}")]
    DataIntegrity {
        kind: DataIntegrityKind,
        detail: String,
    },

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Corrupt bundle: {0}")]
    CorruptBundle(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReproError {
    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        ReproError::DataIntegrity {
            kind: DataIntegrityKind::UnsupportedType,
            detail: detail.into(),
        }
    }

    pub(crate) fn shape(detail: impl Into<String>) -> Self {
        ReproError::DataIntegrity {
            kind: DataIntegrityKind::ShapeMismatch,
            detail: detail.into(),
        }
    }

    /// The data-integrity sub-kind, if this is a data-integrity error
    pub fn integrity_kind(&self) -> Option<DataIntegrityKind> {
        match self {
            ReproError::DataIntegrity { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ReproError {
    fn from(e: serde_json::Error) -> Self {
        ReproError::Serialization(e.to_string())
    }
}

/// Result type for bundle operations
pub type Result<T> = std::result::Result<T, ReproError>;
