//! Stage executors: the three ways a stage turns a prompt into raw records.
//!
//! The pipeline is agnostic to which executor it runs with. Every executor
//! returns the raw JSON values of the records; decoding and validation happen
//! in the stage.

use std::sync::Arc;

use async_trait::async_trait;
use designlens_llm::{GenerateRequest, OutputMode, SchemaHint, TextGenerator};
use designlens_shared::{DesignLensError, Implementation, Result, StepName};
use serde_json::Value;
use tracing::debug;

use crate::schema::extract_records;

/// Everything an executor needs to run one stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub step: StepName,
    /// Plural key the records may be wrapped in.
    pub collection: &'static str,
    pub system_prompt: String,
    pub user_prompt: String,
    pub schema: SchemaHint,
    /// Format instructions for executors that parse reply text.
    pub format_instructions: String,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn implementation(&self) -> Implementation;

    /// Model identifier recorded in result metadata.
    fn model(&self) -> &str;

    async fn execute(&self, request: &StageRequest) -> Result<Vec<Value>>;
}

/// Build the executor for an implementation.
pub fn executor_for(
    implementation: Implementation,
    generator: Arc<dyn TextGenerator>,
) -> Arc<dyn StageExecutor> {
    match implementation {
        Implementation::Parser => Arc::new(ParserExecutor::new(generator)),
        Implementation::FunctionCalling => Arc::new(FunctionCallingExecutor::new(generator)),
        Implementation::Hybrid => Arc::new(HybridExecutor::new(generator)),
    }
}

fn system_with_instructions(request: &StageRequest) -> String {
    format!("{}\n\n{}", request.system_prompt, request.format_instructions)
}

/// Records from every tool call, concatenated in call order.
fn records_from_tool_calls(request: &StageRequest, arguments: &[String]) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    for args in arguments.iter().filter(|a| !a.trim().is_empty()) {
        records.extend(extract_records(request.step, request.collection, args)?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Embeds format instructions and parses the reply text.
pub struct ParserExecutor {
    generator: Arc<dyn TextGenerator>,
}

impl ParserExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StageExecutor for ParserExecutor {
    fn implementation(&self) -> Implementation {
        Implementation::Parser
    }

    fn model(&self) -> &str {
        self.generator.model()
    }

    async fn execute(&self, request: &StageRequest) -> Result<Vec<Value>> {
        let generation = self
            .generator
            .generate(&GenerateRequest::text(
                system_with_instructions(request),
                &request.user_prompt,
            ))
            .await?;
        extract_records(request.step, request.collection, &generation.content)
    }
}

// ---------------------------------------------------------------------------
// Function calling
// ---------------------------------------------------------------------------

/// Forces a tool call; the tool arguments carry the records.
pub struct FunctionCallingExecutor {
    generator: Arc<dyn TextGenerator>,
}

impl FunctionCallingExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StageExecutor for FunctionCallingExecutor {
    fn implementation(&self) -> Implementation {
        Implementation::FunctionCalling
    }

    fn model(&self) -> &str {
        self.generator.model()
    }

    async fn execute(&self, request: &StageRequest) -> Result<Vec<Value>> {
        let generation = self
            .generator
            .generate(
                &GenerateRequest::text(&request.system_prompt, &request.user_prompt)
                    .with_schema(request.schema.clone(), OutputMode::ForcedTool),
            )
            .await?;
        if !generation.has_tool_calls() {
            return Err(DesignLensError::schema(
                request.step,
                format!("model did not call {}", request.schema.name),
            ));
        }
        records_from_tool_calls(request, &generation.tool_arguments)
    }
}

// ---------------------------------------------------------------------------
// Hybrid
// ---------------------------------------------------------------------------

/// Offers the tool and the format instructions; takes whichever the model uses.
pub struct HybridExecutor {
    generator: Arc<dyn TextGenerator>,
}

impl HybridExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StageExecutor for HybridExecutor {
    fn implementation(&self) -> Implementation {
        Implementation::Hybrid
    }

    fn model(&self) -> &str {
        self.generator.model()
    }

    async fn execute(&self, request: &StageRequest) -> Result<Vec<Value>> {
        let generation = self
            .generator
            .generate(
                &GenerateRequest::text(system_with_instructions(request), &request.user_prompt)
                    .with_schema(request.schema.clone(), OutputMode::OptionalTool),
            )
            .await?;
        if generation.has_tool_calls() {
            debug!(step = %request.step, calls = generation.tool_arguments.len(), "using tool arguments");
            records_from_tool_calls(request, &generation.tool_arguments)
        } else {
            extract_records(request.step, request.collection, &generation.content)
        }
    }
}
