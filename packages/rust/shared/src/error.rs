//! Error types for DesignLens.
//!
//! Library crates use [`DesignLensError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::StepName;

/// Top-level error type for all DesignLens operations.
#[derive(Debug, thiserror::Error)]
pub enum DesignLensError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The text-generation backend could not be reached or rejected the call.
    #[error("model unreachable: {0}")]
    Upstream(String),

    /// Model output did not parse into the stage's record schema.
    #[error("schema validation failed during {stage}: {message}")]
    SchemaValidation { stage: StepName, message: String },

    /// Model output parsed, but references records that do not exist.
    #[error("reference integrity violated during {stage}: {message}")]
    ReferenceIntegrity { stage: StepName, message: String },

    /// A text-generation call exceeded its deadline.
    #[error("{stage} timed out after {seconds}s")]
    StageTimeout { stage: StepName, seconds: u64 },

    /// Tracking table or object store failure.
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid caller input (empty text, malformed request id, etc.).
    #[error("invalid input: {message}")]
    Validation { message: String },

    /// Requested record or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The run was cancelled by the caller.
    #[error("cancelled during {stage}")]
    Cancelled { stage: StepName },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DesignLensError>;

/// Coarse failure category recorded on a tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ModelUnreachable,
    StorageUnavailable,
    InvalidInput,
    Timeout,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelUnreachable => "model_unreachable",
            Self::StorageUnavailable => "storage_unavailable",
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = DesignLensError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "model_unreachable" => Ok(Self::ModelUnreachable),
            "storage_unavailable" => Ok(Self::StorageUnavailable),
            "invalid_input" => Ok(Self::InvalidInput),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "internal" => Ok(Self::Internal),
            other => Err(DesignLensError::validation(format!(
                "unknown failure kind '{other}'"
            ))),
        }
    }
}

impl DesignLensError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a schema validation error for a stage.
    pub fn schema(stage: StepName, msg: impl Into<String>) -> Self {
        Self::SchemaValidation {
            stage,
            message: msg.into(),
        }
    }

    /// Create a reference integrity error for a stage.
    pub fn reference(stage: StepName, msg: impl Into<String>) -> Self {
        Self::ReferenceIntegrity {
            stage,
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

    /// Whether the rule-based fallback should replace the model output.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SchemaValidation { .. } | Self::ReferenceIntegrity { .. } | Self::StageTimeout { .. }
        )
    }

    /// Failure category for tracking records.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Upstream(_) => FailureKind::ModelUnreachable,
            Self::Storage(_) | Self::Io { .. } => FailureKind::StorageUnavailable,
            Self::Validation { .. } | Self::NotFound(_) | Self::Conflict(_) => {
                FailureKind::InvalidInput
            }
            Self::StageTimeout { .. } => FailureKind::Timeout,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::Config { .. } | Self::SchemaValidation { .. } | Self::ReferenceIntegrity { .. } => {
                FailureKind::Internal
            }
        }
    }
}
