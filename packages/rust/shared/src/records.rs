//! Research synthesis records and the persisted result document.
//!
//! Records flow strictly forward: chunks feed inferences, inferences feed
//! patterns, patterns feed insights, insights feed design principles.
//! Cross-references are by value: `Inference::chunk_id` → `Chunk::id`,
//! `Pattern::related_inferences` → `Inference::chunk_id`,
//! `Insight::pattern_id` → `Pattern::name`, and
//! `DesignPrinciple::insight_id` → `Insight::headline`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Implementation, OverallStatus, RequestId, StepName};

/// Default `source` for chunks cut from submitted research text.
pub const DEFAULT_CHUNK_SOURCE: &str = "research_data";

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Kind of evidence a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Quote,
    Observation,
    Fact,
    Behavior,
    #[serde(alias = "pain-point", alias = "painpoint")]
    PainPoint,
}

/// A minimal unit of evidence extracted from the research text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Assigned locally when the model omits it.
    #[serde(default)]
    pub id: String,
    pub content: String,
    #[serde(default = "default_chunk_source")]
    pub source: String,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub confidence: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_chunk_source() -> String {
    DEFAULT_CHUNK_SOURCE.into()
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// What a chunk means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub chunk_id: String,
    pub meanings: Vec<String>,
    pub importance: String,
    pub context: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// A recurring theme across inferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub description: String,
    /// Chunk ids of the grouped inferences.
    pub related_inferences: Vec<String>,
    pub themes: BTreeSet<String>,
    pub strength: f64,
    /// Filled in from `related_inferences` when the model leaves it out.
    #[serde(default)]
    pub evidence_count: u32,
}

// ---------------------------------------------------------------------------
// Insight
// ---------------------------------------------------------------------------

/// A non-obvious explanation of why a pattern exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub headline: String,
    pub explanation: String,
    /// Name of the explained pattern.
    pub pattern_id: String,
    pub non_consensus: bool,
    pub first_principles: bool,
    pub impact_score: f64,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
}

// ---------------------------------------------------------------------------
// DesignPrinciple
// ---------------------------------------------------------------------------

/// An actionable guideline derived from an insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPrinciple {
    pub principle: String,
    /// Headline of the source insight.
    pub insight_id: String,
    pub action_verbs: Vec<String>,
    pub design_direction: String,
    pub priority: f64,
    pub feasibility: f64,
}

// ---------------------------------------------------------------------------
// Persisted result
// ---------------------------------------------------------------------------

/// How one stage produced its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub step: StepName,
    pub records: usize,
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub elapsed_ms: u64,
}

/// Provenance attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub request_id: RequestId,
    pub implementation: Implementation,
    pub framework: String,
    pub model: String,
    pub source_ref: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: Vec<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The JSON document stored for every finished analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id: RequestId,
    pub status: OverallStatus,
    pub implementation: Implementation,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration in seconds.
    pub execution_time: f64,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub inferences: Vec<Inference>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub design_principles: Vec<DesignPrinciple>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnalysisMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_deserializes_with_defaults() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"content": "It takes too long", "type": "pain_point", "confidence": 0.9}"#,
        )
        .expect("parse chunk");
        assert!(chunk.id.is_empty());
        assert_eq!(chunk.source, DEFAULT_CHUNK_SOURCE);
        assert_eq!(chunk.chunk_type, ChunkType::PainPoint);
        assert!(chunk.tags.is_empty());
    }

    #[test]
    fn chunk_type_serializes_as_type() {
        let chunk = Chunk {
            id: "chunk_1".into(),
            content: "\"I love it\"".into(),
            source: DEFAULT_CHUNK_SOURCE.into(),
            chunk_type: ChunkType::Quote,
            confidence: 0.8,
            tags: BTreeSet::from(["user_feedback".to_string()]),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "quote");
        assert_eq!(json["tags"][0], "user_feedback");
    }

    #[test]
    fn unknown_chunk_type_is_rejected() {
        let parsed = serde_json::from_str::<Chunk>(
            r#"{"content": "x", "type": "rumor", "confidence": 0.5}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn inference_requires_meanings() {
        let parsed = serde_json::from_str::<Inference>(
            r#"{"chunk_id": "c1", "importance": "high", "context": "ctx", "confidence": 0.7}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn pattern_evidence_count_defaults_to_zero() {
        let pattern: Pattern = serde_json::from_str(
            r#"{"name": "Speed", "description": "d", "related_inferences": ["c1"],
                "themes": ["efficiency", "efficiency"], "strength": 0.8}"#,
        )
        .unwrap();
        assert_eq!(pattern.evidence_count, 0);
        assert_eq!(pattern.themes.len(), 1);
    }
}
