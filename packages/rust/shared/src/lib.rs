//! Shared types, error model, and configuration for DesignLens.
//!
//! This crate is the foundation depended on by all other DesignLens crates.
//! It provides:
//! - [`DesignLensError`]: the unified error type
//! - Research records ([`Chunk`], [`Inference`], [`Pattern`], [`Insight`], [`DesignPrinciple`])
//! - Tracking types ([`RequestId`], [`StepName`], [`StepStatus`], [`TrackingRecord`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod records;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, LlmConfig, StorageConfig, api_key, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{DesignLensError, FailureKind, Result};
pub use records::{
    AnalysisMetadata, AnalysisResult, Chunk, ChunkType, DEFAULT_CHUNK_SOURCE, DesignPrinciple,
    Inference, Insight, Pattern, StageOutcome,
};
pub use types::{
    Implementation, OverallStatus, RequestId, ResearchFile, ResultSummary, StepName, StepRecord,
    StepStatus, TrackingRecord, UsageStats,
};
