//! Persisted analysis results and uploaded research files.
//!
//! Layout inside the object store:
//!
//! ```text
//! <results_prefix>/<request_id>.json
//! <research_prefix>/<file_id>/<filename>
//! ```

use std::sync::Arc;

use chrono::Utc;
use designlens_shared::{
    AnalysisResult, AppConfig, DesignLensError, RequestId, ResearchFile, Result, ResultSummary,
    StepStatus, UsageStats,
};
use designlens_storage::ObjectStore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extensions accepted for research uploads.
pub const RESEARCH_EXTENSIONS: [&str; 5] = ["txt", "md", "markdown", "csv", "json"];

/// Typed access to results and research files in an [`ObjectStore`].
#[derive(Clone)]
pub struct ResultStore {
    objects: Arc<dyn ObjectStore>,
    results_prefix: String,
    research_prefix: String,
}

impl ResultStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        results_prefix: impl Into<String>,
        research_prefix: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            results_prefix: results_prefix.into().trim_end_matches('/').to_string(),
            research_prefix: research_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(objects: Arc<dyn ObjectStore>, config: &AppConfig) -> Self {
        Self::new(
            objects,
            &config.storage.results_prefix,
            &config.storage.research_prefix,
        )
    }

    pub fn result_key(&self, request_id: &RequestId) -> String {
        format!("{}/{request_id}.json", self.results_prefix)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Write the result document and return its key.
    pub async fn save_result(&self, result: &AnalysisResult) -> Result<String> {
        let key = self.result_key(&result.request_id);
        let json = serde_json::to_vec_pretty(result)
            .map_err(|e| DesignLensError::Storage(format!("failed to serialize result: {e}")))?;
        self.objects.put(&key, &json).await?;
        debug!(%key, bytes = json.len(), "saved result");
        Ok(key)
    }

    pub async fn load_result(&self, request_id: &RequestId) -> Result<Option<AnalysisResult>> {
        let key = self.result_key(request_id);
        let Some(bytes) = self.objects.get(&key).await? else {
            return Ok(None);
        };
        let result = serde_json::from_slice(&bytes)
            .map_err(|e| DesignLensError::Storage(format!("corrupt result '{key}': {e}")))?;
        Ok(Some(result))
    }

    /// Stored results, newest first. Unreadable documents are skipped.
    pub async fn list_results(&self, limit: usize) -> Result<Vec<ResultSummary>> {
        let prefix = format!("{}/", self.results_prefix);
        let mut summaries = Vec::new();

        for meta in self.objects.list(&prefix).await? {
            if !meta.key.ends_with(".json") {
                continue;
            }
            let Some(bytes) = self.objects.get(&meta.key).await? else {
                continue;
            };
            match serde_json::from_slice::<AnalysisResult>(&bytes) {
                Ok(result) => summaries.push(ResultSummary {
                    request_id: result.request_id,
                    key: meta.key,
                    status: result.status.as_str().to_string(),
                    implementation: result.implementation,
                    timestamp: result.timestamp,
                    execution_time: result.execution_time,
                    size_bytes: meta.size_bytes,
                }),
                Err(e) => warn!(key = %meta.key, error = %e, "skipping unreadable result"),
            }
        }

        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        summaries.truncate(limit);
        Ok(summaries)
    }

    pub async fn delete_result(&self, request_id: &RequestId) -> Result<bool> {
        self.objects.delete(&self.result_key(request_id)).await
    }

    /// Aggregate counts over every stored result.
    pub async fn usage_stats(&self) -> Result<UsageStats> {
        let summaries = self.list_results(usize::MAX).await?;
        let mut stats = UsageStats {
            total_analyses: summaries.len(),
            ..UsageStats::default()
        };

        let mut completed_time = 0.0;
        for summary in &summaries {
            if summary.status == StepStatus::Completed.as_str() {
                stats.completed += 1;
                completed_time += summary.execution_time;
            } else if summary.status == StepStatus::Failed.as_str() {
                stats.failed += 1;
            }
            *stats
                .implementations_used
                .entry(summary.implementation.as_str().to_string())
                .or_default() += 1;
            stats.total_size_bytes += summary.size_bytes;
        }
        if stats.completed > 0 {
            stats.average_execution_time = Some(completed_time / stats.completed as f64);
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Research files
    // -----------------------------------------------------------------------

    /// Store raw research text under a fresh file id.
    pub async fn save_research(&self, filename: &str, bytes: &[u8]) -> Result<ResearchFile> {
        let filename = sanitize_filename(filename)?;
        if bytes.is_empty() {
            return Err(DesignLensError::validation("research file is empty"));
        }
        if std::str::from_utf8(bytes).is_err() {
            return Err(DesignLensError::validation(format!(
                "research file '{filename}' is not valid UTF-8 text"
            )));
        }

        let file_id = Uuid::now_v7().to_string();
        let key = format!("{}/{file_id}/{filename}", self.research_prefix);

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let sha256 = format!("{:x}", hasher.finalize());

        self.objects.put(&key, bytes).await?;
        info!(%key, size = bytes.len(), "uploaded research file");

        Ok(ResearchFile {
            key,
            file_id,
            filename,
            size_bytes: bytes.len() as u64,
            sha256: Some(sha256),
            uploaded_at: Utc::now(),
        })
    }

    /// Research text stored under `key`.
    pub async fn read_research(&self, key: &str) -> Result<String> {
        self.check_research_key(key)?;
        let bytes = self
            .objects
            .get(key)
            .await?
            .ok_or_else(|| DesignLensError::NotFound(format!("research file '{key}'")))?;
        String::from_utf8(bytes).map_err(|_| {
            DesignLensError::validation(format!("research file '{key}' is not valid UTF-8 text"))
        })
    }

    /// Uploaded research files, newest first.
    pub async fn list_research(&self, limit: usize) -> Result<Vec<ResearchFile>> {
        let prefix = format!("{}/", self.research_prefix);
        let mut files: Vec<ResearchFile> = self
            .objects
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|meta| {
                let rest = meta.key.strip_prefix(&prefix)?;
                let (file_id, filename) = rest.split_once('/')?;
                Some(ResearchFile {
                    file_id: file_id.to_string(),
                    filename: filename.to_string(),
                    size_bytes: meta.size_bytes,
                    sha256: None,
                    uploaded_at: meta.modified,
                    key: meta.key,
                })
            })
            .collect();
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        files.truncate(limit);
        Ok(files)
    }

    pub async fn delete_research(&self, key: &str) -> Result<bool> {
        self.check_research_key(key)?;
        self.objects.delete(key).await
    }

    fn check_research_key(&self, key: &str) -> Result<()> {
        if key.starts_with(&format!("{}/", self.research_prefix)) {
            Ok(())
        } else {
            Err(DesignLensError::validation(format!(
                "'{key}' is not a research file key (expected '{}/...')",
                self.research_prefix
            )))
        }
    }
}

/// Reduce an upload name to a safe single path segment with a text extension.
fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();

    let extension = cleaned
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if cleaned.is_empty() || !RESEARCH_EXTENSIONS.contains(&extension.as_str()) {
        return Err(DesignLensError::validation(format!(
            "unsupported research file '{name}': expected one of .{}",
            RESEARCH_EXTENSIONS.join(", .")
        )));
    }
    Ok(cleaned)
}
