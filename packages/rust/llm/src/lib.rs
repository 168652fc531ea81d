//! Text-generation backends for DesignLens.
//!
//! [`TextGenerator`] is the seam the pipeline calls through; [`OpenAiClient`]
//! implements it against any OpenAI-compatible `/chat/completions` endpoint,
//! supporting plain-text replies and forced or optional tool calls.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ClientConfig, OpenAiClient, TextGenerator};
pub use error::LlmError;
pub use types::{GenerateRequest, Generation, Message, OutputMode, Role, SchemaHint};
