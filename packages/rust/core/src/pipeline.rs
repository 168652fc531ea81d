//! Linear orchestrator: chunk → infer → relate → explain → activate.
//!
//! The orchestrator owns tracking updates and metadata; the stages only
//! produce records. A failed stage ends the run and no later stage starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use designlens_shared::{
    AnalysisMetadata, AnalysisResult, AppConfig, Chunk, DesignLensError, DesignPrinciple,
    Implementation, Inference, Insight, Pattern, RequestId, Result, StageOutcome, StepName,
    StepStatus,
};
use designlens_storage::StatusTracker;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::executor::StageExecutor;
use crate::stages::{self, AnalysisState, StageContext, completion_message};

/// Source reference recorded for inline research text.
pub const INLINE_SOURCE: &str = "inline";

// ---------------------------------------------------------------------------
// Cancellation and progress
// ---------------------------------------------------------------------------

/// Cooperative cancellation shared between a run and its caller.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage calls the model.
    fn stage_started(&self, step: StepName);
    /// Called once a stage has produced its records.
    fn stage_finished(&self, step: StepName, outcome: &StageOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _step: StepName) {}
    fn stage_finished(&self, _step: StepName, _outcome: &StageOutcome) {}
}

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Configuration for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Deadline for each stage's model call.
    pub stage_timeout: Duration,
    /// Attach metadata to successful outputs.
    pub include_metadata: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(180),
            include_metadata: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            include_metadata: config.defaults.include_metadata,
        }
    }
}

/// Records of a completed run.
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub request_id: RequestId,
    pub implementation: Implementation,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration in seconds.
    pub execution_time: f64,
    pub chunks: Vec<Chunk>,
    pub inferences: Vec<Inference>,
    pub patterns: Vec<Pattern>,
    pub insights: Vec<Insight>,
    pub design_principles: Vec<DesignPrinciple>,
    pub metadata: Option<AnalysisMetadata>,
}

impl AnalysisOutput {
    /// The persisted document for this run.
    pub fn into_result(self) -> AnalysisResult {
        AnalysisResult {
            request_id: self.request_id,
            status: StepStatus::Completed,
            implementation: self.implementation,
            timestamp: self.timestamp,
            execution_time: self.execution_time,
            chunks: self.chunks,
            inferences: self.inferences,
            patterns: self.patterns,
            insights: self.insights,
            design_principles: self.design_principles,
            metadata: self.metadata,
        }
    }
}

/// Why and where a run stopped.
#[derive(Debug)]
pub struct RunFailure {
    pub step: StepName,
    pub error: DesignLensError,
    pub execution_time: f64,
    /// Always present so the failure can be persisted.
    pub metadata: AnalysisMetadata,
}

impl RunFailure {
    /// A failed document: no records, the error in metadata.
    pub fn to_result(&self) -> AnalysisResult {
        AnalysisResult {
            request_id: self.metadata.request_id.clone(),
            status: StepStatus::Failed,
            implementation: self.metadata.implementation,
            timestamp: self.metadata.completed_at.unwrap_or_else(Utc::now),
            execution_time: self.execution_time,
            chunks: Vec::new(),
            inferences: Vec::new(),
            patterns: Vec::new(),
            insights: Vec::new(),
            design_principles: Vec::new(),
            metadata: Some(self.metadata.clone()),
        }
    }
}

/// Per-run inputs that are not part of the pipeline itself.
pub struct RunContext<'a> {
    pub request_id: RequestId,
    pub source_ref: String,
    pub cancel: &'a CancelFlag,
    pub progress: &'a dyn ProgressReporter,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the five stages with one executor.
pub struct Pipeline {
    executor: Arc<dyn StageExecutor>,
    tracker: Option<Arc<dyn StatusTracker>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(executor: Arc<dyn StageExecutor>, config: PipelineConfig) -> Self {
        Self {
            executor,
            tracker: None,
            config,
        }
    }

    /// Report step progress to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<dyn StatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn implementation(&self) -> Implementation {
        self.executor.implementation()
    }

    /// Analyze `research_data` under a fresh request id.
    ///
    /// When a tracker is attached, a tracking record is created first.
    pub async fn run(&self, research_data: &str) -> Result<AnalysisOutput> {
        let request_id = RequestId::generate();
        if let Some(tracker) = &self.tracker {
            tracker
                .create(&request_id, INLINE_SOURCE, self.implementation())
                .await?;
        }
        let cancel = CancelFlag::new();
        let ctx = RunContext {
            request_id,
            source_ref: INLINE_SOURCE.into(),
            cancel: &cancel,
            progress: &SilentProgress,
        };
        self.execute(research_data.into(), ctx)
            .await
            .map_err(|failure| failure.error)
    }

    /// Run every stage for an already-tracked request.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, implementation = %self.implementation()))]
    pub async fn execute(
        &self,
        research_data: Arc<str>,
        ctx: RunContext<'_>,
    ) -> std::result::Result<AnalysisOutput, RunFailure> {
        let clock = Instant::now();
        let mut metadata = AnalysisMetadata {
            request_id: ctx.request_id.clone(),
            implementation: self.implementation(),
            framework: self.implementation().framework().to_string(),
            model: self.executor.model().to_string(),
            source_ref: ctx.source_ref.clone(),
            started_at: Utc::now(),
            completed_at: None,
            stages: Vec::new(),
            error: None,
        };

        info!(chars = research_data.len(), "starting analysis");

        let stage_ctx = StageContext {
            executor: self.executor.as_ref(),
            timeout: self.config.stage_timeout,
            cancel: ctx.cancel,
        };
        let mut state = AnalysisState::new(research_data);

        for step in StepName::ALL {
            if ctx.cancel.is_cancelled() {
                let error = DesignLensError::Cancelled { stage: step };
                return Err(self.fail(&ctx, step, error, metadata, clock).await);
            }

            self.track(&ctx.request_id, step, StepStatus::Processing, &processing_message(step))
                .await;
            ctx.progress.stage_started(step);

            let result = match step {
                StepName::Chunking => stages::chunk(state, &stage_ctx).await,
                StepName::Inferring => stages::infer(state, &stage_ctx).await,
                StepName::Relating => stages::relate(state, &stage_ctx).await,
                StepName::Explaining => stages::explain(state, &stage_ctx).await,
                StepName::Activating => stages::activate(state, &stage_ctx).await,
            };

            state = match result {
                Ok((next, outcome)) => {
                    self.track(
                        &ctx.request_id,
                        step,
                        StepStatus::Completed,
                        &completion_message(&outcome),
                    )
                    .await;
                    ctx.progress.stage_finished(step, &outcome);
                    metadata.stages.push(outcome);
                    next
                }
                Err(error) => return Err(self.fail(&ctx, step, error, metadata, clock).await),
            };
        }

        let timestamp = Utc::now();
        metadata.completed_at = Some(timestamp);
        let execution_time = clock.elapsed().as_secs_f64();
        let (chunks, inferences, patterns, insights, design_principles) = state.into_parts();

        info!(
            chunks = chunks.len(),
            inferences = inferences.len(),
            patterns = patterns.len(),
            insights = insights.len(),
            principles = design_principles.len(),
            elapsed_s = %format!("{execution_time:.2}"),
            "analysis completed"
        );

        Ok(AnalysisOutput {
            request_id: ctx.request_id,
            implementation: self.implementation(),
            timestamp,
            execution_time,
            chunks,
            inferences,
            patterns,
            insights,
            design_principles,
            metadata: self.config.include_metadata.then_some(metadata),
        })
    }

    async fn fail(
        &self,
        ctx: &RunContext<'_>,
        step: StepName,
        error: DesignLensError,
        mut metadata: AnalysisMetadata,
        clock: Instant,
    ) -> RunFailure {
        let message = error.to_string();
        warn!(step = %step, kind = %error.kind(), error = %message, "analysis failed");

        self.track(&ctx.request_id, step, StepStatus::Failed, &message)
            .await;
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker
                .record_failure(&ctx.request_id, error.kind(), &message)
                .await
            {
                warn!(error = %e, "failed to record failure");
            }
        }

        metadata.completed_at = Some(Utc::now());
        metadata.error = Some(message);
        RunFailure {
            step,
            error,
            execution_time: clock.elapsed().as_secs_f64(),
            metadata,
        }
    }

    async fn track(&self, request_id: &RequestId, step: StepName, status: StepStatus, message: &str) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        if let Err(e) = tracker.update_step(request_id, step, status, message).await {
            warn!(step = %step, status = status.as_str(), error = %e, "tracking update failed");
        }
    }
}

fn processing_message(step: StepName) -> String {
    format!("Creating {}", step.output_noun())
}

#[cfg(test)]
mod tests {
    use designlens_shared::{FailureKind, StepStatus};
    use designlens_storage::Storage;
    use uuid::Uuid;

    use super::*;
    use crate::executor::executor_for;
    use crate::fallback::{COMPLEXITY_HEADLINE, SPEED_HEADLINE};
    use crate::testing::ScriptedGenerator;

    const TWO_LINES: &str = "I just want to get this done quickly.\nThe interface is cluttered.";

    async fn temp_tracker() -> Arc<dyn StatusTracker> {
        let path = std::env::temp_dir().join(format!("dl_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&path).await.expect("open tracker"))
    }

    fn pipeline(generator: ScriptedGenerator, tracker: Arc<dyn StatusTracker>) -> Pipeline {
        let config = PipelineConfig {
            stage_timeout: Duration::from_secs(5),
            include_metadata: true,
        };
        Pipeline::new(executor_for(Implementation::Parser, Arc::new(generator)), config)
            .with_tracker(tracker)
    }

    #[tokio::test]
    async fn two_line_scenario_completes_via_fallbacks() {
        let tracker = temp_tracker().await;
        let output = pipeline(ScriptedGenerator::new(), tracker.clone())
            .run(TWO_LINES)
            .await
            .unwrap();

        assert_eq!(output.chunks.len(), 2);
        assert_eq!(output.inferences.len(), 2);
        let names: Vec<_> = output.patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["User Efficiency Needs", "Information Clarity"]);
        let headlines: Vec<_> = output.insights.iter().map(|i| i.headline.as_str()).collect();
        assert_eq!(headlines, vec![SPEED_HEADLINE, COMPLEXITY_HEADLINE]);
        assert_eq!(output.design_principles.len(), 2);

        let metadata = output.metadata.as_ref().unwrap();
        assert_eq!(metadata.stages.len(), 5);
        assert!(metadata.stages.iter().all(|s| s.used_fallback));
        assert_eq!(metadata.model, "scripted");

        let record = tracker.get(&output.request_id).await.unwrap().unwrap();
        assert_eq!(record.overall_status, StepStatus::Completed);
        for step in StepName::ALL {
            assert_eq!(record.step(step).unwrap().status, StepStatus::Completed);
        }
        assert_eq!(
            record.step(StepName::Chunking).unwrap().message,
            "Created 2 chunks using fallback method"
        );
    }

    #[tokio::test]
    async fn references_hold_in_the_output() {
        let output = pipeline(ScriptedGenerator::new(), temp_tracker().await)
            .run(TWO_LINES)
            .await
            .unwrap();
        let chunk_ids: Vec<_> = output.chunks.iter().map(|c| &c.id).collect();
        assert!(output.inferences.iter().all(|i| chunk_ids.contains(&&i.chunk_id)));
        let names: Vec<_> = output.patterns.iter().map(|p| &p.name).collect();
        assert!(output.insights.iter().all(|i| names.contains(&&i.pattern_id)));
        let headlines: Vec<_> = output.insights.iter().map(|i| &i.headline).collect();
        assert!(output.design_principles.iter().all(|p| headlines.contains(&&p.insight_id)));
    }

    #[tokio::test]
    async fn upstream_failure_stops_the_run() {
        let tracker = temp_tracker().await;
        let generator = ScriptedGenerator::new()
            .reply_text("not json")
            .fail("connection refused");
        let err = pipeline(generator, tracker.clone())
            .run(TWO_LINES)
            .await
            .unwrap_err();
        assert!(matches!(err, DesignLensError::Upstream(_)));

        let records = tracker.list(10).await.unwrap();
        let record = &records[0];
        assert_eq!(record.overall_status, StepStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::ModelUnreachable));
        assert_eq!(record.step(StepName::Chunking).unwrap().status, StepStatus::Completed);
        assert_eq!(record.step(StepName::Inferring).unwrap().status, StepStatus::Failed);
        assert_eq!(record.step(StepName::Relating).unwrap().status, StepStatus::Pending);
        assert!(
            record
                .step(StepName::Inferring)
                .unwrap()
                .message
                .starts_with("model unreachable")
        );
    }

    #[tokio::test]
    async fn empty_input_fails_with_invalid_input() {
        let tracker = temp_tracker().await;
        let err = pipeline(ScriptedGenerator::new(), tracker.clone())
            .run("   ")
            .await
            .unwrap_err();
        assert!(matches!(err, DesignLensError::Validation { .. }));

        let record = &tracker.list(1).await.unwrap()[0];
        assert_eq!(record.failure_kind, Some(FailureKind::InvalidInput));
        assert_eq!(record.step(StepName::Chunking).unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_marks_current_step_failed() {
        let tracker = temp_tracker().await;
        let generator = ScriptedGenerator::new().always_delay(Duration::from_secs(30));
        let pipeline = pipeline(generator, tracker.clone());
        let request_id = RequestId::generate();
        tracker
            .create(&request_id, INLINE_SOURCE, Implementation::Parser)
            .await
            .unwrap();

        let cancel = CancelFlag::new();
        let ctx = RunContext {
            request_id: request_id.clone(),
            source_ref: INLINE_SOURCE.into(),
            cancel: &cancel,
            progress: &SilentProgress,
        };
        let (result, ()) = tokio::join!(pipeline.execute(TWO_LINES.into(), ctx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let failure = result.unwrap_err();
        assert_eq!(failure.step, StepName::Chunking);
        assert!(matches!(failure.error, DesignLensError::Cancelled { .. }));
        assert_eq!(failure.to_result().status, StepStatus::Failed);
        assert!(failure.to_result().metadata.unwrap().error.is_some());

        let record = tracker.get(&request_id).await.unwrap().unwrap();
        assert_eq!(record.overall_status, StepStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::Cancelled));
        assert_eq!(record.step(StepName::Inferring).unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn metadata_can_be_omitted() {
        let config = PipelineConfig {
            stage_timeout: Duration::from_secs(5),
            include_metadata: false,
        };
        let pipeline = Pipeline::new(
            executor_for(Implementation::Hybrid, Arc::new(ScriptedGenerator::new())),
            config,
        );
        let output = pipeline.run("Simple is better").await.unwrap();
        assert!(output.metadata.is_none());
        let result = output.into_result();
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.implementation, Implementation::Hybrid);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let flag = Arc::new(CancelFlag::new());
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        assert!(flag.is_cancelled());
    }
}
