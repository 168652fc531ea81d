//! Library surface for submitting and managing analyses.
//!
//! `submit` returns as soon as the request is tracked; the run continues on
//! its own tokio task. Each run has its own state, tracking record and
//! cancellation flag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use designlens_llm::TextGenerator;
use designlens_shared::{
    AnalysisResult, AppConfig, DesignLensError, Implementation, RequestId, ResearchFile, Result,
    ResultSummary, StepStatus, TrackingRecord, UsageStats,
};
use designlens_storage::StatusTracker;
use tokio::sync::watch;
use tracing::{Instrument, info, info_span, warn};

use crate::executor::executor_for;
use crate::pipeline::{
    CancelFlag, INLINE_SOURCE, Pipeline, PipelineConfig, ProgressReporter, RunContext,
};
use crate::results::ResultStore;

/// Where the research text comes from.
#[derive(Debug, Clone)]
pub enum AnalysisSource {
    Text(String),
    /// Key of an uploaded research file.
    Stored(String),
}

/// Parameters of one analysis submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source: AnalysisSource,
    /// Defaults to the configured implementation.
    pub implementation: Option<Implementation>,
    /// Generated when absent.
    pub request_id: Option<RequestId>,
    /// Defaults to the configured value.
    pub include_metadata: Option<bool>,
}

impl SubmitRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            source: AnalysisSource::Text(text.into()),
            implementation: None,
            request_id: None,
            include_metadata: None,
        }
    }

    pub fn stored(key: impl Into<String>) -> Self {
        Self {
            source: AnalysisSource::Stored(key.into()),
            ..Self::text(String::new())
        }
    }
}

/// Catalogue entry describing one executor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImplementationInfo {
    pub name: &'static str,
    pub framework: &'static str,
    pub description: &'static str,
    pub default: bool,
}

type Finished = Option<Arc<AnalysisResult>>;

struct RunHandle {
    cancel: Arc<CancelFlag>,
    done: watch::Receiver<Finished>,
}

/// A submitted analysis.
#[derive(Debug)]
pub struct Submission {
    pub request_id: RequestId,
    done: watch::Receiver<Finished>,
}

impl Submission {
    /// Wait for the run and return the document it produced.
    ///
    /// The document is returned even when persisting it failed.
    pub async fn finished(mut self) -> Option<Arc<AnalysisResult>> {
        let value = self.done.wait_for(Option::is_some).await.ok()?;
        (*value).clone()
    }
}

type RunRegistry = Arc<Mutex<HashMap<RequestId, RunHandle>>>;

/// Submits analyses and serves their status and results.
#[derive(Clone)]
pub struct AnalysisService {
    generator: Option<Arc<dyn TextGenerator>>,
    tracker: Arc<dyn StatusTracker>,
    store: ResultStore,
    config: AppConfig,
    runs: RunRegistry,
}

impl AnalysisService {
    /// A service that can query and maintain analyses but not run them.
    pub fn new(tracker: Arc<dyn StatusTracker>, store: ResultStore, config: AppConfig) -> Self {
        Self {
            generator: None,
            tracker,
            store,
            config,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enable [`submit`](Self::submit) with `generator`.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Track a new analysis and start it in the background.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Submission> {
        let generator = self
            .generator
            .clone()
            .ok_or_else(|| DesignLensError::config("no text generator configured"))?;
        let (text, source_ref) = match request.source {
            AnalysisSource::Text(text) => (text, INLINE_SOURCE.to_string()),
            AnalysisSource::Stored(key) => {
                let text = self.store.read_research(&key).await?;
                (text, key)
            }
        };
        if text.trim().is_empty() {
            return Err(DesignLensError::validation("research data is empty"));
        }

        let request_id = request.request_id.unwrap_or_else(RequestId::generate);
        let implementation = request
            .implementation
            .unwrap_or(self.config.defaults.implementation);
        self.tracker
            .create(&request_id, &source_ref, implementation)
            .await?;

        let mut pipeline_config = PipelineConfig::from_app(&self.config);
        if let Some(include) = request.include_metadata {
            pipeline_config.include_metadata = include;
        }
        let pipeline = Pipeline::new(
            executor_for(implementation, generator),
            pipeline_config,
        )
        .with_tracker(self.tracker.clone());

        let cancel = Arc::new(CancelFlag::new());
        let (done_tx, done_rx) = watch::channel(None);
        self.registry().insert(
            request_id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx.clone(),
            },
        );

        info!(%request_id, %implementation, source = %source_ref, "analysis submitted");

        let span = info_span!("analysis", request_id = %request_id);
        let service = self.clone();
        let id = request_id.clone();
        tokio::spawn(
            async move {
                let ctx = RunContext {
                    request_id: id.clone(),
                    source_ref,
                    cancel: &cancel,
                    progress: progress.as_ref(),
                };
                let document = match pipeline.execute(text.into(), ctx).await {
                    Ok(output) => output.into_result(),
                    Err(failure) => failure.to_result(),
                };
                service.persist(&document).await;
                service.registry().remove(&id);
                let _ = done_tx.send(Some(Arc::new(document)));
            }
            .instrument(span),
        );

        Ok(Submission {
            request_id,
            done: done_rx,
        })
    }

    /// Store the document and point the tracking record at it.
    async fn persist(&self, document: &AnalysisResult) {
        let id = &document.request_id;
        let outcome = match self.store.save_result(document).await {
            Ok(key) => self.tracker.update_result_pointer(id, &key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(request_id = %id, error = %e, "failed to persist result");
            if let Err(e) = self.tracker.record_storage_error(id, &e.to_string()).await {
                warn!(request_id = %id, error = %e, "failed to record storage error");
            }
        }
    }

    /// Wait until a run submitted by this service has finished.
    ///
    /// Returns immediately for requests that are not running here.
    pub async fn wait(&self, request_id: &RequestId) {
        let done = self
            .registry()
            .get(request_id)
            .map(|handle| handle.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(Option::is_some).await;
        }
    }

    /// Ask a running analysis to stop. Returns `false` if it is not running.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        match self.registry().get(request_id) {
            Some(handle) => {
                info!(%request_id, "cancelling analysis");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self, request_id: &RequestId) -> Result<TrackingRecord> {
        self.tracker
            .get(request_id)
            .await?
            .ok_or_else(|| DesignLensError::NotFound(format!("analysis '{request_id}'")))
    }

    /// The persisted result; only available once the analysis completed.
    pub async fn result(&self, request_id: &RequestId) -> Result<AnalysisResult> {
        let record = self.status(request_id).await?;
        if record.overall_status != StepStatus::Completed {
            return Err(DesignLensError::Conflict(format!(
                "analysis '{request_id}' is {}, results are available once it completes",
                record.overall_status.as_str()
            )));
        }
        self.store
            .load_result(request_id)
            .await?
            .ok_or_else(|| DesignLensError::NotFound(format!("result for '{request_id}'")))
    }

    pub async fn list_analyses(&self, limit: usize) -> Result<Vec<TrackingRecord>> {
        self.tracker.list(limit).await
    }

    pub async fn list_results(&self, limit: usize) -> Result<Vec<ResultSummary>> {
        self.store.list_results(limit).await
    }

    /// Remove the result document and tracking record, cancelling a live run.
    pub async fn delete_analysis(&self, request_id: &RequestId) -> Result<bool> {
        if self.cancel(request_id) {
            self.wait(request_id).await;
        }
        let had_result = self.store.delete_result(request_id).await?;
        let had_record = self.tracker.delete(request_id).await?;
        Ok(had_result || had_record)
    }

    pub async fn stats(&self) -> Result<UsageStats> {
        self.store.usage_stats().await
    }

    // -----------------------------------------------------------------------
    // Research files
    // -----------------------------------------------------------------------

    pub async fn upload_research(&self, filename: &str, bytes: &[u8]) -> Result<ResearchFile> {
        self.store.save_research(filename, bytes).await
    }

    pub async fn list_research(&self, limit: usize) -> Result<Vec<ResearchFile>> {
        self.store.list_research(limit).await
    }

    pub async fn delete_research(&self, key: &str) -> Result<bool> {
        self.store.delete_research(key).await
    }

    /// Every executor with its description.
    pub fn implementations(&self) -> Vec<ImplementationInfo> {
        implementations(self.config.defaults.implementation)
    }
}

/// Catalogue of executors, marking `default`.
pub fn implementations(default: Implementation) -> Vec<ImplementationInfo> {
    Implementation::ALL
        .into_iter()
        .map(|imp| ImplementationInfo {
            name: imp.as_str(),
            framework: imp.framework(),
            description: imp.description(),
            default: imp == default,
        })
        .collect()
}
