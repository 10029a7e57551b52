//! Error taxonomy of the exchange subsystem.
use thiserror::Error;

use crate::model::ItemRef;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transition not allowed from the current status, or its guard failed.
    /// Nothing was mutated.
    #[error("invalid status: cannot {transition} from {from}")]
    InvalidStatus {
        transition: &'static str,
        from: &'static str,
    },

    #[error("guard failed for {transition}: {reason}")]
    GuardFailed {
        transition: &'static str,
        reason: String,
    },

    #[error("serialization failed for {item}: {reason}")]
    Serialization { item: ItemRef, reason: String },

    #[error("batch size must be within 1..={max}, got {size}")]
    BatchSize { size: usize, max: usize },

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("feedback kind mismatch: expected {expected}, found {found}")]
    FeedbackKind { expected: String, found: String },

    #[error("malformed feedback: {0}")]
    MalformedFeedback(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cloning failed: {0}")]
    Cloning(String),

    #[error("an employee record already exists for {measure}/{siret}/{approval_number}")]
    DuplicateCloning {
        measure: String,
        siret: String,
        approval_number: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;
