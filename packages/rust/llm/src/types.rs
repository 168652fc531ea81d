//! Request and response types for text generation.

use std::time::Duration;

use serde::Serialize;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Describes the structure the caller expects back, as a callable function.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaHint {
    pub name: String,
    pub description: String,
    /// JSON Schema of the function arguments.
    pub parameters: serde_json::Value,
}

/// How the model should deliver its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Plain reply text.
    Text,
    /// The model must call the schema function.
    ForcedTool,
    /// The schema function is offered; the model may answer in text instead.
    OptionalTool,
}

/// One text-generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub schema: Option<SchemaHint>,
    pub mode: OutputMode,
}

impl GenerateRequest {
    /// A system + user prompt answered in plain text.
    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            schema: None,
            mode: OutputMode::Text,
        }
    }

    /// Attach a schema function and the mode to use it in.
    pub fn with_schema(mut self, schema: SchemaHint, mode: OutputMode) -> Self {
        self.schema = Some(schema);
        self.mode = mode;
        self
    }
}

/// What the model returned.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Reply text; empty when the model only called tools.
    pub content: String,
    /// Raw JSON arguments of every tool call, in order.
    pub tool_arguments: Vec<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: Option<String>,
}

impl Generation {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_arguments.iter().any(|a| !a.trim().is_empty())
    }
}
