//! Record schemas and parsing of model output.
//!
//! Each record type knows its JSON Schema, which doubles as the tool
//! definition for function calling and as the format instructions embedded in
//! prompts. Model output is accepted as a bare JSON array, an array inside a
//! fenced code block, a single record object, or an object wrapping one array.

use std::sync::LazyLock;

use designlens_llm::SchemaHint;
use designlens_shared::{
    Chunk, DesignLensError, DesignPrinciple, Inference, Insight, Pattern, Result, StepName,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fence regex is valid")
});

// ---------------------------------------------------------------------------
// Record schemas
// ---------------------------------------------------------------------------

/// A record produced by one pipeline stage.
pub trait StageRecord: DeserializeOwned + Send + Sized + 'static {
    /// Stage that produces this record.
    const STEP: StepName;
    /// Plural key used when records are wrapped in an object.
    const COLLECTION: &'static str;
    /// Function name offered to the model.
    const FUNCTION: &'static str;

    /// JSON Schema of one record.
    fn item_schema() -> Value;

    /// Tool definition whose arguments carry an array of records.
    fn schema_hint() -> SchemaHint {
        let mut properties = serde_json::Map::new();
        properties.insert(
            Self::COLLECTION.to_string(),
            json!({ "type": "array", "items": Self::item_schema() }),
        );
        SchemaHint {
            name: Self::FUNCTION.into(),
            description: format!("Record every {} you produce.", Self::COLLECTION.replace('_', " ")),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": [Self::COLLECTION]
            }),
        }
    }

    /// Format instructions appended to the system prompt.
    fn format_instructions() -> String {
        let schema = serde_json::to_string_pretty(&Self::item_schema()).unwrap_or_default();
        format!(
            "Respond with a JSON array only, no commentary. \
             Every element must conform to this JSON schema:\n{schema}"
        )
    }
}

fn score() -> Value {
    json!({ "type": "number", "minimum": 0, "maximum": 1 })
}

fn string_list() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

impl StageRecord for Chunk {
    const STEP: StepName = StepName::Chunking;
    const COLLECTION: &'static str = "chunks";
    const FUNCTION: &'static str = "create_chunks";

    fn item_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The chunk text" },
                "source": { "type": "string", "description": "Where the chunk came from" },
                "type": {
                    "type": "string",
                    "enum": ["quote", "observation", "fact", "behavior", "pain_point"]
                },
                "confidence": score(),
                "tags": string_list()
            },
            "required": ["content", "type", "confidence", "tags"]
        })
    }
}

impl StageRecord for Inference {
    const STEP: StepName = StepName::Inferring;
    const COLLECTION: &'static str = "inferences";
    const FUNCTION: &'static str = "create_inferences";

    fn item_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "chunk_id": { "type": "string", "description": "Id of the interpreted chunk" },
                "meanings": string_list(),
                "importance": { "type": "string", "description": "Why this matters" },
                "context": { "type": "string", "description": "What it says about the problem" },
                "confidence": score(),
                "reasoning": { "type": "string" }
            },
            "required": ["chunk_id", "meanings", "importance", "context", "confidence"]
        })
    }
}

impl StageRecord for Pattern {
    const STEP: StepName = StepName::Relating;
    const COLLECTION: &'static str = "patterns";
    const FUNCTION: &'static str = "create_patterns";

    fn item_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "description": { "type": "string" },
                "related_inferences": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Chunk ids of the grouped inferences",
                    "minItems": 1
                },
                "themes": string_list(),
                "strength": score(),
                "evidence_count": { "type": "integer", "minimum": 0 }
            },
            "required": ["name", "description", "related_inferences", "themes", "strength"]
        })
    }
}

impl StageRecord for Insight {
    const STEP: StepName = StepName::Explaining;
    const COLLECTION: &'static str = "insights";
    const FUNCTION: &'static str = "create_insights";

    fn item_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "headline": { "type": "string" },
                "explanation": { "type": "string" },
                "pattern_id": { "type": "string", "description": "Exact name of the pattern" },
                "non_consensus": { "type": "boolean" },
                "first_principles": { "type": "boolean" },
                "impact_score": score(),
                "supporting_evidence": string_list()
            },
            "required": [
                "headline", "explanation", "pattern_id",
                "non_consensus", "first_principles", "impact_score"
            ]
        })
    }
}

impl StageRecord for DesignPrinciple {
    const STEP: StepName = StepName::Activating;
    const COLLECTION: &'static str = "design_principles";
    const FUNCTION: &'static str = "create_design_principles";

    fn item_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "principle": { "type": "string" },
                "insight_id": { "type": "string", "description": "Exact headline of the insight" },
                "action_verbs": string_list(),
                "design_direction": { "type": "string" },
                "priority": score(),
                "feasibility": score()
            },
            "required": [
                "principle", "insight_id", "action_verbs",
                "design_direction", "priority", "feasibility"
            ]
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Pull raw record values out of model text.
pub fn extract_records(step: StepName, collection: &str, text: &str) -> Result<Vec<Value>> {
    let candidate = FENCED_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str())
        .trim();

    if candidate.is_empty() {
        return Err(DesignLensError::schema(step, "model returned empty output"));
    }

    let value: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(first_err) => {
            // Tolerate prose around the JSON payload.
            let start = candidate.find(['[', '{']);
            let end = candidate.rfind([']', '}']);
            match (start, end) {
                (Some(s), Some(e)) if e > s => serde_json::from_str(&candidate[s..=e])
                    .map_err(|e| DesignLensError::schema(step, format!("invalid JSON: {e}")))?,
                _ => {
                    return Err(DesignLensError::schema(
                        step,
                        format!("invalid JSON: {first_err}"),
                    ));
                }
            }
        }
    };

    unwrap_records(step, collection, value)
}

fn unwrap_records(step: StepName, collection: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            if let Some(inner) = map.remove(collection) {
                return unwrap_records(step, collection, inner);
            }
            let arrays: Vec<&String> = map
                .iter()
                .filter(|(_, v)| v.is_array())
                .map(|(k, _)| k)
                .collect();
            if map.len() == 1 && arrays.len() == 1 {
                let key = arrays[0].clone();
                return match map.remove(&key) {
                    Some(Value::Array(items)) => Ok(items),
                    _ => Ok(Vec::new()),
                };
            }
            Ok(vec![Value::Object(map)])
        }
        other => Err(DesignLensError::schema(
            step,
            format!("expected a JSON array, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Deserialize raw values into typed records.
pub fn decode_records<T: StageRecord>(values: Vec<Value>) -> Result<Vec<T>> {
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| {
            serde_json::from_value(value).map_err(|e| {
                DesignLensError::schema(T::STEP, format!("record {idx} does not match schema: {e}"))
            })
        })
        .collect()
}

/// Clamp a model-supplied score into `[0, 1]`.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_array() {
        let values = extract_records(StepName::Chunking, "chunks", r#"[{"a": 1}, {"a": 2}]"#).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn extracts_fenced_array() {
        let text = "Here you go:\n```json\n[{\"a\": 1}]\n```\nLet me know!";
        let values = extract_records(StepName::Chunking, "chunks", text).unwrap();
        assert_eq!(values, vec![json!({"a": 1})]);
    }

    #[test]
    fn extracts_array_surrounded_by_prose() {
        let text = "Sure. [{\"a\": 1}] Hope this helps.";
        let values = extract_records(StepName::Chunking, "chunks", text).unwrap();
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn unwraps_collection_and_single_array_objects() {
        let values = extract_records(
            StepName::Relating,
            "patterns",
            r#"{"patterns": [{"name": "x"}], "note": "ignored"}"#,
        )
        .unwrap();
        assert_eq!(values, vec![json!({"name": "x"})]);

        let values =
            extract_records(StepName::Relating, "patterns", r#"{"results": [{"name": "y"}]}"#).unwrap();
        assert_eq!(values, vec![json!({"name": "y"})]);
    }

    #[test]
    fn single_record_object_is_one_record() {
        let text = r#"{"name": "Speed", "related_inferences": ["c1"], "themes": ["x"]}"#;
        let values = extract_records(StepName::Relating, "patterns", text).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["name"], "Speed");
    }

    #[test]
    fn malformed_output_is_a_schema_error() {
        let err = extract_records(StepName::Inferring, "inferences", "I cannot help with that").unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, DesignLensError::SchemaValidation { stage: StepName::Inferring, .. }));

        let err = extract_records(StepName::Inferring, "inferences", "   ").unwrap_err();
        assert!(err.to_string().contains("empty output"));

        let err = extract_records(StepName::Inferring, "inferences", "42").unwrap_err();
        assert!(err.to_string().contains("got a number"));
    }

    #[test]
    fn decode_reports_failing_record() {
        let values = vec![
            json!({"content": "ok", "type": "quote", "confidence": 0.9, "tags": []}),
            json!({"content": "missing type", "confidence": 0.9}),
        ];
        let err = decode_records::<Chunk>(values).unwrap_err();
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn parse_is_stable_across_reserialization() {
        let text = r#"[{"chunk_id": "c1", "meanings": ["Users want speed"], "importance": "high",
                        "context": "ctx", "confidence": 0.8}]"#;
        let first: Vec<Inference> =
            decode_records(extract_records(StepName::Inferring, "inferences", text).unwrap()).unwrap();
        let reserialized = serde_json::to_string(&first).unwrap();
        let second: Vec<Inference> = decode_records(
            extract_records(StepName::Inferring, "inferences", &reserialized).unwrap(),
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn schema_hint_wraps_items_in_collection() {
        let hint = DesignPrinciple::schema_hint();
        assert_eq!(hint.name, "create_design_principles");
        assert_eq!(hint.parameters["required"][0], "design_principles");
        assert_eq!(
            hint.parameters["properties"]["design_principles"]["items"]["required"][1],
            "insight_id"
        );
        assert!(Chunk::format_instructions().contains("pain_point"));
    }

    #[test]
    fn clamp_handles_out_of_range_and_nan() {
        assert_eq!(clamp_score(1.7), 1.0);
        assert_eq!(clamp_score(-0.2), 0.0);
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(0.42), 0.42);
    }
}
