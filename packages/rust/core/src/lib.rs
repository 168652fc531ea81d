//! Synthesis pipeline and analysis service for DesignLens.
//!
//! Research text flows through five stages (chunk, infer, relate, explain,
//! activate), each backed by a [`StageExecutor`] and a rule-based fallback.
//! [`AnalysisService`] runs pipelines in the background and persists results.

pub mod executor;
pub mod fallback;
pub mod pipeline;
pub mod prompts;
pub mod results;
pub mod schema;
pub mod service;
pub mod stages;
pub mod validate;

#[cfg(test)]
mod testing;

pub use executor::{
    FunctionCallingExecutor, HybridExecutor, ParserExecutor, StageExecutor, StageRequest,
    executor_for,
};
pub use pipeline::{
    AnalysisOutput, CancelFlag, INLINE_SOURCE, Pipeline, PipelineConfig, ProgressReporter,
    RunContext, RunFailure, SilentProgress,
};
pub use results::ResultStore;
pub use service::{
    AnalysisService, AnalysisSource, ImplementationInfo, SubmitRequest, Submission,
    implementations,
};
pub use stages::{AnalysisState, Phase};
