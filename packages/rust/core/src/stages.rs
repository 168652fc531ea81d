//! The five synthesis stages and the immutable state they pass along.
//!
//! Each stage consumes an [`AnalysisState`] and returns the next one together
//! with a [`StageOutcome`]. A stage whose predecessor list is empty produces
//! an empty list without calling the model. Unusable model output is replaced
//! by the rule-based fallback; upstream failures and cancellation abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use designlens_shared::{
    Chunk, DesignLensError, DesignPrinciple, Inference, Insight, Pattern, Result, StageOutcome,
    StepName,
};
use tracing::{debug, warn};

use crate::executor::{StageExecutor, StageRequest};
use crate::pipeline::CancelFlag;
use crate::schema::{StageRecord, decode_records};
use crate::{fallback, prompts, validate};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where a run stands, derived from which lists have been computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Initialized,
    Chunked,
    Inferred,
    Patterned,
    InsightsGenerated,
    Completed,
}

/// Research text plus every list computed so far.
#[derive(Debug, Clone)]
pub struct AnalysisState {
    research_data: Arc<str>,
    chunks: Option<Vec<Chunk>>,
    inferences: Option<Vec<Inference>>,
    patterns: Option<Vec<Pattern>>,
    insights: Option<Vec<Insight>>,
    design_principles: Option<Vec<DesignPrinciple>>,
}

impl AnalysisState {
    pub fn new(research_data: impl Into<Arc<str>>) -> Self {
        Self {
            research_data: research_data.into(),
            chunks: None,
            inferences: None,
            patterns: None,
            insights: None,
            design_principles: None,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.design_principles.is_some() {
            Phase::Completed
        } else if self.insights.is_some() {
            Phase::InsightsGenerated
        } else if self.patterns.is_some() {
            Phase::Patterned
        } else if self.inferences.is_some() {
            Phase::Inferred
        } else if self.chunks.is_some() {
            Phase::Chunked
        } else {
            Phase::Initialized
        }
    }

    pub fn research_data(&self) -> &str {
        &self.research_data
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.chunks.as_deref().unwrap_or_default()
    }

    pub fn inferences(&self) -> &[Inference] {
        self.inferences.as_deref().unwrap_or_default()
    }

    pub fn patterns(&self) -> &[Pattern] {
        self.patterns.as_deref().unwrap_or_default()
    }

    pub fn insights(&self) -> &[Insight] {
        self.insights.as_deref().unwrap_or_default()
    }

    pub fn design_principles(&self) -> &[DesignPrinciple] {
        self.design_principles.as_deref().unwrap_or_default()
    }

    pub fn with_chunks(self, chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: Some(chunks),
            ..self
        }
    }

    pub fn with_inferences(self, inferences: Vec<Inference>) -> Self {
        Self {
            inferences: Some(inferences),
            ..self
        }
    }

    pub fn with_patterns(self, patterns: Vec<Pattern>) -> Self {
        Self {
            patterns: Some(patterns),
            ..self
        }
    }

    pub fn with_insights(self, insights: Vec<Insight>) -> Self {
        Self {
            insights: Some(insights),
            ..self
        }
    }

    pub fn with_design_principles(self, design_principles: Vec<DesignPrinciple>) -> Self {
        Self {
            design_principles: Some(design_principles),
            ..self
        }
    }

    /// Record count of the list a stage produced, if computed.
    pub fn count(&self, step: StepName) -> Option<usize> {
        match step {
            StepName::Chunking => self.chunks.as_ref().map(Vec::len),
            StepName::Inferring => self.inferences.as_ref().map(Vec::len),
            StepName::Relating => self.patterns.as_ref().map(Vec::len),
            StepName::Explaining => self.insights.as_ref().map(Vec::len),
            StepName::Activating => self.design_principles.as_ref().map(Vec::len),
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<Chunk>,
        Vec<Inference>,
        Vec<Pattern>,
        Vec<Insight>,
        Vec<DesignPrinciple>,
    ) {
        (
            self.chunks.unwrap_or_default(),
            self.inferences.unwrap_or_default(),
            self.patterns.unwrap_or_default(),
            self.insights.unwrap_or_default(),
            self.design_principles.unwrap_or_default(),
        )
    }
}

// ---------------------------------------------------------------------------
// Stage runner
// ---------------------------------------------------------------------------

/// Per-run dependencies shared by every stage.
pub struct StageContext<'a> {
    pub executor: &'a dyn StageExecutor,
    pub timeout: Duration,
    pub cancel: &'a CancelFlag,
}

/// Status message for a finished stage, e.g. "Created 3 chunks".
pub fn completion_message(outcome: &StageOutcome) -> String {
    let noun = outcome.step.output_noun();
    if outcome.used_fallback {
        format!("Created {} {noun} using fallback method", outcome.records)
    } else {
        format!("Created {} {noun}", outcome.records)
    }
}

/// Run one stage: model call under a deadline, validation, and fallback.
async fn run_stage<T: StageRecord>(
    ctx: &StageContext<'_>,
    user_prompt: String,
    validate: impl FnOnce(Vec<T>) -> Result<Vec<T>>,
    fallback: impl FnOnce() -> Vec<T>,
) -> Result<(Vec<T>, StageOutcome)> {
    let step = T::STEP;
    let started = Instant::now();

    if ctx.cancel.is_cancelled() {
        return Err(DesignLensError::Cancelled { stage: step });
    }

    let request = StageRequest {
        step,
        collection: T::COLLECTION,
        system_prompt: prompts::system_prompt(step).to_string(),
        user_prompt,
        schema: T::schema_hint(),
        format_instructions: T::format_instructions(),
    };

    let attempt = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(DesignLensError::Cancelled { stage: step }),
        res = tokio::time::timeout(ctx.timeout, ctx.executor.execute(&request)) => match res {
            Ok(values) => values,
            Err(_) => Err(DesignLensError::StageTimeout {
                stage: step,
                seconds: ctx.timeout.as_secs(),
            }),
        },
    };

    let (records, fallback_reason) = match attempt.and_then(decode_records::<T>).and_then(validate) {
        Ok(records) => (records, None),
        Err(err) if err.is_recoverable() => {
            warn!(step = %step, error = %err, "model output unusable, using fallback");
            (fallback(), Some(err.to_string()))
        }
        Err(err) => return Err(err),
    };

    let outcome = StageOutcome {
        step,
        records: records.len(),
        used_fallback: fallback_reason.is_some(),
        fallback_reason,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    debug!(step = %step, records = outcome.records, fallback = outcome.used_fallback, "stage finished");
    Ok((records, outcome))
}

fn skipped(step: StepName) -> StageOutcome {
    debug!(step = %step, "no input records, skipping model call");
    StageOutcome {
        step,
        records: 0,
        used_fallback: false,
        fallback_reason: None,
        elapsed_ms: 0,
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Split research text into chunks.
pub async fn chunk(
    state: AnalysisState,
    ctx: &StageContext<'_>,
) -> Result<(AnalysisState, StageOutcome)> {
    if state.research_data().trim().is_empty() {
        return Err(DesignLensError::validation("research data is empty"));
    }
    let text = state.research_data.clone();
    let (chunks, outcome) = run_stage(
        ctx,
        prompts::chunking_prompt(&text),
        validate::chunks,
        || fallback::chunks(&text),
    )
    .await?;
    Ok((state.with_chunks(chunks), outcome))
}

/// Interpret every chunk.
pub async fn infer(
    state: AnalysisState,
    ctx: &StageContext<'_>,
) -> Result<(AnalysisState, StageOutcome)> {
    if state.chunks().is_empty() {
        return Ok((state.with_inferences(Vec::new()), skipped(StepName::Inferring)));
    }
    let chunks = state.chunks();
    let (inferences, outcome) = run_stage(
        ctx,
        prompts::inferring_prompt(chunks),
        |records| validate::inferences(records, chunks),
        || fallback::inferences(chunks),
    )
    .await?;
    Ok((state.with_inferences(inferences), outcome))
}

/// Group inferences into patterns.
pub async fn relate(
    state: AnalysisState,
    ctx: &StageContext<'_>,
) -> Result<(AnalysisState, StageOutcome)> {
    if state.inferences().is_empty() {
        return Ok((state.with_patterns(Vec::new()), skipped(StepName::Relating)));
    }
    let inferences = state.inferences();
    let (patterns, outcome) = run_stage(
        ctx,
        prompts::relating_prompt(inferences),
        |records| validate::patterns(records, inferences),
        || fallback::patterns(inferences),
    )
    .await?;
    Ok((state.with_patterns(patterns), outcome))
}

/// Explain why each pattern exists.
pub async fn explain(
    state: AnalysisState,
    ctx: &StageContext<'_>,
) -> Result<(AnalysisState, StageOutcome)> {
    if state.patterns().is_empty() {
        return Ok((state.with_insights(Vec::new()), skipped(StepName::Explaining)));
    }
    let patterns = state.patterns();
    let (insights, outcome) = run_stage(
        ctx,
        prompts::explaining_prompt(patterns),
        |records| validate::insights(records, patterns),
        || fallback::insights(patterns),
    )
    .await?;
    Ok((state.with_insights(insights), outcome))
}

/// Turn insights into design principles.
pub async fn activate(
    state: AnalysisState,
    ctx: &StageContext<'_>,
) -> Result<(AnalysisState, StageOutcome)> {
    if state.insights().is_empty() {
        return Ok((
            state.with_design_principles(Vec::new()),
            skipped(StepName::Activating),
        ));
    }
    let insights = state.insights();
    let (principles, outcome) = run_stage(
        ctx,
        prompts::activating_prompt(insights),
        |records| validate::principles(records, insights),
        || fallback::principles(insights),
    )
    .await?;
    Ok((state.with_design_principles(principles), outcome))
}

#[cfg(test)]
mod tests {
    use designlens_shared::Implementation;

    use super::*;
    use crate::executor::executor_for;
    use crate::testing::ScriptedGenerator;

    async fn run_chunking(
        generator: ScriptedGenerator,
        timeout: Duration,
        text: &str,
    ) -> Result<(AnalysisState, StageOutcome)> {
        let executor = executor_for(Implementation::Parser, Arc::new(generator));
        let cancel = CancelFlag::new();
        let ctx = StageContext {
            executor: executor.as_ref(),
            timeout,
            cancel: &cancel,
        };
        chunk(AnalysisState::new(text), &ctx).await
    }

    #[test]
    fn phase_follows_computed_lists() {
        let state = AnalysisState::new("x");
        assert_eq!(state.phase(), Phase::Initialized);
        let state = state.with_chunks(Vec::new());
        assert_eq!(state.phase(), Phase::Chunked);
        assert_eq!(state.count(StepName::Chunking), Some(0));
        assert_eq!(state.count(StepName::Inferring), None);
        let state = state
            .with_inferences(Vec::new())
            .with_patterns(Vec::new())
            .with_insights(Vec::new());
        assert_eq!(state.phase(), Phase::InsightsGenerated);
        assert_eq!(state.with_design_principles(Vec::new()).phase(), Phase::Completed);
    }

    #[tokio::test]
    async fn valid_model_output_is_used() {
        let generator = ScriptedGenerator::new().reply_text(
            r#"[{"content": "Users want speed", "type": "observation", "confidence": 0.9, "tags": ["speed"]}]"#,
        );
        let (state, outcome) = run_chunking(generator, Duration::from_secs(5), "Users want speed")
            .await
            .unwrap();
        assert_eq!(state.chunks().len(), 1);
        assert!(state.chunks()[0].id.starts_with("chunk_"));
        assert!(!outcome.used_fallback);
        assert_eq!(completion_message(&outcome), "Created 1 chunks");
    }

    #[tokio::test]
    async fn malformed_output_falls_back() {
        let (state, outcome) = run_chunking(
            ScriptedGenerator::new(),
            Duration::from_secs(5),
            "line one\nline two",
        )
        .await
        .unwrap();
        assert_eq!(state.chunks().len(), 2);
        assert!(outcome.used_fallback);
        assert!(outcome.fallback_reason.unwrap().contains("schema validation"));
        assert_eq!(
            completion_message(&StageOutcome {
                step: StepName::Chunking,
                records: 2,
                used_fallback: true,
                fallback_reason: None,
                elapsed_ms: 0
            }),
            "Created 2 chunks using fallback method"
        );
    }

    #[tokio::test]
    async fn timeout_falls_back_and_is_noted() {
        let generator = ScriptedGenerator::new().always_delay(Duration::from_secs(10));
        let (state, outcome) = run_chunking(generator, Duration::from_millis(50), "slow line")
            .await
            .unwrap();
        assert_eq!(state.chunks().len(), 1);
        assert!(outcome.used_fallback);
        assert!(outcome.fallback_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn upstream_failure_is_not_recovered() {
        let generator = ScriptedGenerator::new().fail("connection refused");
        let err = run_chunking(generator, Duration::from_secs(5), "text")
            .await
            .unwrap_err();
        assert!(matches!(err, DesignLensError::Upstream(_)));
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let err = run_chunking(ScriptedGenerator::new(), Duration::from_secs(5), "  \n ")
            .await
            .unwrap_err();
        assert!(matches!(err, DesignLensError::Validation { .. }));
    }

    #[tokio::test]
    async fn empty_predecessor_skips_the_model() {
        let generator = Arc::new(ScriptedGenerator::new());
        let executor = executor_for(Implementation::Hybrid, generator.clone());
        let cancel = CancelFlag::new();
        let ctx = StageContext {
            executor: executor.as_ref(),
            timeout: Duration::from_secs(5),
            cancel: &cancel,
        };
        let state = AnalysisState::new("x").with_chunks(Vec::new());
        let (state, outcome) = infer(state, &ctx).await.unwrap();
        assert!(state.inferences().is_empty());
        assert_eq!(state.phase(), Phase::Inferred);
        assert_eq!(outcome.records, 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn dangling_reference_falls_back_to_rules() {
        let generator = Arc::new(ScriptedGenerator::new().reply_text(
            r#"[{"chunk_id": "chunk_missing", "meanings": ["x"], "importance": "i",
                 "context": "c", "confidence": 0.5}]"#,
        ));
        let executor = executor_for(Implementation::Parser, generator);
        let cancel = CancelFlag::new();
        let ctx = StageContext {
            executor: executor.as_ref(),
            timeout: Duration::from_secs(5),
            cancel: &cancel,
        };
        let chunks = fallback::chunks("It should be fast");
        let state = AnalysisState::new("It should be fast").with_chunks(chunks.clone());
        let (state, outcome) = infer(state, &ctx).await.unwrap();
        assert!(outcome.used_fallback);
        assert!(outcome.fallback_reason.unwrap().contains("reference integrity"));
        assert_eq!(state.inferences()[0].chunk_id, chunks[0].id);
    }

    #[tokio::test]
    async fn cancelled_flag_stops_stage() {
        let executor = executor_for(Implementation::Parser, Arc::new(ScriptedGenerator::new()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let ctx = StageContext {
            executor: executor.as_ref(),
            timeout: Duration::from_secs(5),
            cancel: &cancel,
        };
        let err = chunk(AnalysisState::new("text"), &ctx).await.unwrap_err();
        assert!(matches!(err, DesignLensError::Cancelled { stage: StepName::Chunking }));
    }
}
