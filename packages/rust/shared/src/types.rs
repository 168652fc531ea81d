//! Identifiers, lifecycle statuses, and tracking types.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DesignLensError, FailureKind, Result};

/// Request ids double as object-store key segments, so keep them path-safe.
static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").expect("request id regex is valid")
});

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Identifier of one analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new time-sortable request identifier (UUID v7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Validate a caller-supplied identifier.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if REQUEST_ID_RE.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(DesignLensError::validation(format!(
                "request id '{value}' must be 1-128 characters of [A-Za-z0-9_-]"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = DesignLensError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The five pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Chunking,
    Inferring,
    Relating,
    Explaining,
    Activating,
}

impl StepName {
    /// All steps in pipeline order.
    pub const ALL: [StepName; 5] = [
        Self::Chunking,
        Self::Inferring,
        Self::Relating,
        Self::Explaining,
        Self::Activating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunking => "chunking",
            Self::Inferring => "inferring",
            Self::Relating => "relating",
            Self::Explaining => "explaining",
            Self::Activating => "activating",
        }
    }

    /// Message a step carries before it starts.
    pub fn waiting_message(&self) -> &'static str {
        match self {
            Self::Chunking => "Waiting to start chunking",
            Self::Inferring => "Waiting for chunking to complete",
            Self::Relating => "Waiting for inference to complete",
            Self::Explaining => "Waiting for pattern analysis to complete",
            Self::Activating => "Waiting for explanation to complete",
        }
    }

    /// Name of the records the step produces, for status messages.
    pub fn output_noun(&self) -> &'static str {
        match self {
            Self::Chunking => "chunks",
            Self::Inferring => "inferences",
            Self::Relating => "patterns",
            Self::Explaining => "insights",
            Self::Activating => "design principles",
        }
    }

    /// Zero-based position in the pipeline.
    pub fn position(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = DesignLensError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DesignLensError::validation(format!("unknown step '{s}'")))
    }
}

/// Status of a single step. Moves only forward:
/// `pending → processing → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Re-asserting a non-terminal status (to refresh its message) is allowed.
    /// A pending step may fail directly when the run stops before it starts.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Pending | Self::Processing | Self::Failed) => true,
            (Self::Processing, Self::Processing | Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = DesignLensError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DesignLensError::validation(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

/// Overall status of a request. Shares the step vocabulary.
pub type OverallStatus = StepStatus;

/// Per-step progress within a tracking record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A step that has not started yet.
    pub fn waiting(step: StepName) -> Self {
        Self {
            status: StepStatus::Pending,
            message: step.waiting_message().to_string(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TrackingRecord
// ---------------------------------------------------------------------------

/// Durable progress record for one analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub request_id: RequestId,
    /// Where the research text came from (`inline` or a research file key).
    pub source_ref: String,
    pub implementation: Implementation,
    pub overall_status: OverallStatus,
    pub steps: BTreeMap<StepName, StepRecord>,
    /// Object key of the persisted result, empty until set.
    #[serde(default)]
    pub result_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Storage problem that did not stop the analysis itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingRecord {
    /// Fresh record with every step pending.
    pub fn new(request_id: RequestId, source_ref: impl Into<String>, implementation: Implementation) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            source_ref: source_ref.into(),
            implementation,
            overall_status: StepStatus::Pending,
            steps: StepName::ALL
                .into_iter()
                .map(|step| (step, StepRecord::waiting(step)))
                .collect(),
            result_data: String::new(),
            failure_kind: None,
            failure_message: None,
            storage_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step: StepName) -> Option<&StepRecord> {
        self.steps.get(&step)
    }

    /// The first step that has not completed, if any.
    pub fn current_step(&self) -> Option<StepName> {
        StepName::ALL
            .into_iter()
            .find(|step| self.step(*step).is_none_or(|s| s.status != StepStatus::Completed))
    }

    pub fn is_finished(&self) -> bool {
        self.overall_status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

/// How a stage turns a prompt into records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Implementation {
    /// Format instructions in the prompt; reply text parsed as JSON.
    #[serde(alias = "langchain")]
    Parser,
    /// Forced tool call per stage; tool arguments are the records.
    #[serde(alias = "openai")]
    FunctionCalling,
    /// Format instructions plus an optional tool; whichever the model uses.
    #[default]
    Hybrid,
}

impl Implementation {
    pub const ALL: [Implementation; 3] = [Self::Parser, Self::FunctionCalling, Self::Hybrid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parser => "parser",
            Self::FunctionCalling => "function_calling",
            Self::Hybrid => "hybrid",
        }
    }

    /// Short label recorded in result metadata.
    pub fn framework(&self) -> &'static str {
        match self {
            Self::Parser => "Structured output parsing",
            Self::FunctionCalling => "Native function calling",
            Self::Hybrid => "Function calling with structured output parsing",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Parser => {
                "Embeds JSON format instructions in each prompt and parses the reply text"
            }
            Self::FunctionCalling => {
                "Forces one tool call per record; tool arguments are validated as records"
            }
            Self::Hybrid => {
                "Offers a tool and format instructions; uses tool arguments when present, \
                 otherwise parses the reply text"
            }
        }
    }
}

impl std::fmt::Display for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Implementation {
    type Err = DesignLensError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parser" | "langchain" => Ok(Self::Parser),
            "function_calling" | "function-calling" | "openai" => Ok(Self::FunctionCalling),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(DesignLensError::validation(format!(
                "unknown implementation '{other}': expected parser, function_calling, or hybrid"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored objects
// ---------------------------------------------------------------------------

/// An uploaded research file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchFile {
    /// Object-store key; pass this to submit an analysis of the file.
    pub key: String,
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
    /// SHA-256 of the content, known only at upload time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Listing entry for a persisted analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub request_id: RequestId,
    pub key: String,
    pub status: String,
    pub implementation: Implementation,
    pub timestamp: DateTime<Utc>,
    pub execution_time: f64,
    pub size_bytes: u64,
}

/// Aggregate usage over persisted results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_analyses: usize,
    pub completed: usize,
    pub failed: usize,
    pub implementations_used: BTreeMap<String, usize>,
    /// Combined size of all result documents.
    pub total_size_bytes: u64,
    /// Mean execution time of completed analyses, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_execution_time: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrip() {
        let id = RequestId::generate();
        let parsed: RequestId = id.to_string().parse().expect("parse RequestId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn request_id_rejects_unsafe_values() {
        assert!(RequestId::parse("analysis_20240101_ab12").is_ok());
        assert!(RequestId::parse("").is_err());
        assert!(RequestId::parse("../etc/passwd").is_err());
        assert!(RequestId::parse("has space").is_err());
        assert!(RequestId::parse(&"a".repeat(129)).is_err());
    }

    #[test]
    fn steps_are_ordered() {
        let mut steps = StepName::ALL.to_vec();
        steps.reverse();
        steps.sort();
        assert_eq!(steps, StepName::ALL.to_vec());
        assert_eq!(StepName::Relating.position(), 2);
        assert_eq!("explaining".parse::<StepName>().unwrap(), StepName::Explaining);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn new_tracking_record_is_all_pending() {
        let record = TrackingRecord::new(RequestId::generate(), "inline", Implementation::Hybrid);
        assert_eq!(record.overall_status, StepStatus::Pending);
        assert_eq!(record.steps.len(), 5);
        assert_eq!(
            record.step(StepName::Inferring).unwrap().message,
            "Waiting for chunking to complete"
        );
        assert_eq!(record.current_step(), Some(StepName::Chunking));
        assert!(record.result_data.is_empty());
    }

    #[test]
    fn tracking_record_serializes_steps_by_name() {
        let record = TrackingRecord::new(RequestId::generate(), "inline", Implementation::Parser);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["steps"]["activating"]["status"], "pending");
        assert_eq!(json["implementation"], "parser");
    }

    #[test]
    fn implementation_accepts_legacy_names() {
        assert_eq!("openai".parse::<Implementation>().unwrap(), Implementation::FunctionCalling);
        assert_eq!("langchain".parse::<Implementation>().unwrap(), Implementation::Parser);
        let parsed: Implementation = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(parsed, Implementation::FunctionCalling);
        assert_eq!(Implementation::default(), Implementation::Hybrid);
        assert!("crewai".parse::<Implementation>().is_err());
    }
}
