//! Error types for the CLV pipeline.

use chrono::NaiveDateTime;
use thiserror::Error;

/// Errors that abort a pipeline run.
///
/// Conditions that only affect a single row or a single model are not errors:
/// dropped rows are counted in [`crate::ingest::IngestReport`] and model failures
/// are stored in that model's slot as [`crate::model::ModelFailure`].
#[derive(Debug, Error)]
pub enum ClvError {
    /// Nothing survived ingestion
    #[error("no usable transactions in input")]
    NoTransactions,

    /// No transaction falls on or before the snapshot date
    #[error("observation window is empty (snapshot date {snapshot_date})")]
    EmptyObservationWindow {
        /// Snapshot date that produced the empty window
        snapshot_date: NaiveDateTime,
    },

    /// No customer could be assembled into a training example
    #[error("eligible customer universe is empty")]
    EmptyCustomerUniverse,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The chronological split left nothing to train on
    #[error("training prefix is empty")]
    EmptyTrainingSet,

    /// Matrix and target dimensions disagree
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// A regressor could not be fitted
    #[error("failed to fit {model}: {reason}")]
    Fit {
        /// Model name
        model: String,
        /// Failure reason
        reason: String,
    },

    /// Missing column in a loaded table
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error while reading or writing tables
    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    /// Configuration file could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
