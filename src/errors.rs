//! Typed error hierarchy for the Anvil pipeline.
//!
//! Four enums cover the failure classes the orchestrator switches on:
//! - `ModelError` — model backend call failures
//! - `SchemaError` — stage output failed extraction or validation
//! - `StageError` — the stage itself declared a failure payload
//! - `ContinuationError` — checkpoint redemption failures
//!
//! `PipelineError` wraps them for the few places that need a single type.

use crate::artifact::Stage;
use thiserror::Error;

/// Failures from the text-generation backend.
///
/// The model client never retries internally; retry policy belongs to the
/// orchestrator, which matches on these variants explicitly.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model backend rate limited the request")]
    RateLimited,

    #[error("Model backend quota exhausted")]
    QuotaExhausted,

    #[error("Model call failed: {0}")]
    Other(String),
}

/// A stage's raw output could not be turned into a validated artifact.
#[derive(Debug, Error)]
#[error("Schema validation failed for {stage} stage: {reason}")]
pub struct SchemaError {
    pub stage: Stage,
    pub reason: String,
}

impl SchemaError {
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// The stage emitted an explicit `{"error": {...}}` payload.
///
/// Distinct from a parse failure: the stage ran, understood its input, and
/// reported that it cannot produce an artifact. Never retried.
#[derive(Debug, Error)]
#[error("{stage} stage declared an error ({code}): {message}")]
pub struct StageError {
    pub stage: Stage,
    pub code: String,
    pub message: String,
}

/// Failures redeeming a continuation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContinuationError {
    #[error("Continuation {0} not found")]
    NotFound(String),

    #[error("Continuation {0} has expired")]
    Expired(String),

    #[error("Continuation {0} was already consumed")]
    Consumed(String),

    #[error("Continuation {id} does not belong to subject {subject_id}")]
    SubjectMismatch { id: String, subject_id: String },

    #[error("Continuation {0} state blob failed checksum verification")]
    ChecksumMismatch(String),
}

/// Top-level pipeline failure, for callers that need one error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Continuation(#[from] ContinuationError),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
