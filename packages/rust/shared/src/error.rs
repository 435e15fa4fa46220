//! Error types for Curricula.
//!
//! Library crates use [`CurriculaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every variant maps onto one [`FailureClass`]. The orchestrator decides
//! what to do with a failing job from the class and [`CurriculaError::is_fatal`],
//! never from the message text.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Failure taxonomy shared by every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Ambiguous or invalid request.
    User,
    /// Missing or conflicting curriculum data.
    Data,
    /// Stage tool or model failure, including schema mismatch.
    Agent,
    /// License or provenance ambiguity.
    Legal,
    /// Infrastructure failure or budget exhaustion.
    System,
    /// Anything the taxonomy does not name. Halts the job.
    Unclassified,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Data => "data",
            Self::Agent => "agent",
            Self::Legal => "legal",
            Self::System => "system",
            Self::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for all Curricula operations.
#[derive(Debug, thiserror::Error)]
pub enum CurriculaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a search or document source.
    #[error("network error: {0}")]
    Network(String),

    /// HTML or document content could not be turned into chunks.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The request itself is unusable (e.g. normalization below threshold).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A jurisdiction resolution whose fields contradict each other.
    #[error("invalid jurisdiction resolution: {0}")]
    InvalidResolution(String),

    /// A stage payload did not match its declared schema.
    #[error("schema mismatch in {stage}: {message}")]
    SchemaMismatch { stage: String, message: String },

    /// The state machine has no entry for this (state, condition) pair.
    #[error("no transition from {from} on {condition}")]
    InvalidTransition { from: String, condition: String },

    /// A stage tool or model call failed.
    #[error("{stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// Model bridge protocol or process error.
    #[error("model error: {0}")]
    Model(String),

    /// Missing, conflicting or stale curriculum data.
    #[error("data error: {0}")]
    Data(String),

    /// Optimistic write check lost against a concurrent writer.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// License or provenance could not be established.
    #[error("legal error: {0}")]
    Legal(String),

    /// A capability quota stayed exhausted past the wait budget.
    #[error("quota exhausted for {0}")]
    QuotaExhausted(String),

    /// A resume event that does not apply to the job's current state.
    #[error("cannot resume job: {0}")]
    Resume(String),

    /// Failure that fits no other variant. Always fatal.
    #[error("unclassified failure: {0}")]
    Unclassified(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CurriculaError>;

impl CurriculaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a schema mismatch for the named stage.
    pub fn schema(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a stage failure for the named stage.
    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map this error onto the failure taxonomy.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Validation { .. } | Self::InvalidResolution(_) | Self::Resume(_) => {
                FailureClass::User
            }
            Self::Data(_) | Self::Conflict(_) => FailureClass::Data,
            Self::SchemaMismatch { .. }
            | Self::Stage { .. }
            | Self::Model(_)
            | Self::Parse { .. }
            | Self::Network(_) => FailureClass::Agent,
            Self::Legal(_) => FailureClass::Legal,
            Self::Config { .. } | Self::Storage(_) | Self::Io { .. } | Self::QuotaExhausted(_) => {
                FailureClass::System
            }
            Self::InvalidTransition { .. } | Self::Unclassified(_) => FailureClass::Unclassified,
        }
    }

    /// Errors that end the job immediately with no retry and no pause.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidResolution(_)
                | Self::Conflict(_)
                | Self::Unclassified(_)
        )
    }
}
