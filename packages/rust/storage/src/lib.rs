//! Durable state for DesignLens: request tracking and object storage.
//!
//! [`Storage`] wraps a local libSQL database holding one tracking record per
//! analysis request, exposed through the [`StatusTracker`] trait.
//! [`LocalObjectStore`] keeps result documents and uploaded research files on
//! disk behind the [`ObjectStore`] trait.
//!
//! **Access rules:**
//! - Analysis runs: read-write via [`Storage::open`]
//! - Status queries: read-only via [`Storage::open_readonly`]

mod migrations;
pub mod objects;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use designlens_shared::{
    DesignLensError, FailureKind, Implementation, RequestId, Result, StepName, StepRecord,
    StepStatus, TrackingRecord,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use tracing::debug;

pub use objects::{LocalObjectStore, ObjectMeta, ObjectStore};

// ---------------------------------------------------------------------------
// Tracker trait
// ---------------------------------------------------------------------------

/// Per-request progress tracking.
///
/// Step statuses only move forward (`pending → processing → completed|failed`);
/// implementations reject regressions.
#[async_trait]
pub trait StatusTracker: Send + Sync {
    /// Create a record with every step pending. Fails with `Conflict` if the id exists.
    async fn create(
        &self,
        request_id: &RequestId,
        source_ref: &str,
        implementation: Implementation,
    ) -> Result<TrackingRecord>;

    /// Move one step to `status` and derive the overall status.
    async fn update_step(
        &self,
        request_id: &RequestId,
        step: StepName,
        status: StepStatus,
        message: &str,
    ) -> Result<()>;

    /// Point the record at its persisted result.
    async fn update_result_pointer(&self, request_id: &RequestId, pointer: &str) -> Result<()>;

    /// Mark the request failed with a categorized reason.
    async fn record_failure(
        &self,
        request_id: &RequestId,
        kind: FailureKind,
        message: &str,
    ) -> Result<()>;

    /// Note a storage problem that did not stop the analysis.
    async fn record_storage_error(&self, request_id: &RequestId, message: &str) -> Result<()>;

    async fn get(&self, request_id: &RequestId) -> Result<Option<TrackingRecord>>;

    /// Most recent records first.
    async fn list(&self, limit: usize) -> Result<Vec<TrackingRecord>>;

    /// Returns `false` when no record existed.
    async fn delete(&self, request_id: &RequestId) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// libSQL implementation
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes read-modify-write sequences on the shared connection.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DesignLensError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DesignLensError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DesignLensError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DesignLensError::Storage(format!(
                "tracking database {} does not exist",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DesignLensError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DesignLensError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DesignLensError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DesignLensError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn request_exists(&self, request_id: &RequestId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM analysis_requests WHERE request_id = ?1",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }

    async fn overall_status(&self, request_id: &RequestId) -> Result<StepStatus> {
        let mut rows = self
            .conn
            .query(
                "SELECT overall_status FROM analysis_requests WHERE request_id = ?1",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => text(&row, 0)?.parse(),
            None => Err(DesignLensError::NotFound(format!("request {request_id}"))),
        }
    }

    async fn load_steps(&self, request_id: &RequestId) -> Result<Vec<(StepName, StepRecord)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT step, status, message, started_at, completed_at
                 FROM analysis_steps WHERE request_id = ?1 ORDER BY position",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let step: StepName = text(&row, 0)?.parse()?;
            steps.push((
                step,
                StepRecord {
                    status: text(&row, 1)?.parse()?,
                    message: text(&row, 2)?,
                    started_at: opt_timestamp(&row, 3)?,
                    completed_at: opt_timestamp(&row, 4)?,
                },
            ));
        }
        Ok(steps)
    }

    async fn touch(&self, request_id: &RequestId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE analysis_requests SET updated_at = ?1 WHERE request_id = ?2",
                params![now_string(), request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn set_overall_status(&self, request_id: &RequestId, status: StepStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE analysis_requests SET overall_status = ?1 WHERE request_id = ?2",
                params![status.as_str(), request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

/// Overall status implied by a step transition, if it changes.
fn next_overall_status(overall: StepStatus, step: StepName, status: StepStatus) -> Option<StepStatus> {
    let next = match status {
        StepStatus::Failed => StepStatus::Failed,
        StepStatus::Processing if overall == StepStatus::Pending => StepStatus::Processing,
        StepStatus::Completed if step == StepName::Activating => StepStatus::Completed,
        _ => return None,
    };
    overall.can_transition_to(next).then_some(next)
}

#[async_trait]
impl StatusTracker for Storage {
    async fn create(
        &self,
        request_id: &RequestId,
        source_ref: &str,
        implementation: Implementation,
    ) -> Result<TrackingRecord> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        if self.request_exists(request_id).await? {
            return Err(DesignLensError::Conflict(format!(
                "request {request_id} already exists"
            )));
        }

        let record = TrackingRecord::new(request_id.clone(), source_ref, implementation);
        let created_at = format_timestamp(&record.created_at);

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO analysis_requests
               (request_id, source_ref, implementation, overall_status, result_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '', ?5, ?6)",
            params![
                request_id.as_str(),
                source_ref,
                implementation.as_str(),
                record.overall_status.as_str(),
                created_at.as_str(),
                created_at.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;

        for (step, step_record) in &record.steps {
            tx.execute(
                "INSERT INTO analysis_steps (request_id, step, position, status, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    request_id.as_str(),
                    step.as_str(),
                    step.position() as i64,
                    step_record.status.as_str(),
                    step_record.message.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(%request_id, source_ref, "tracking record created");
        Ok(record)
    }

    async fn update_step(
        &self,
        request_id: &RequestId,
        step: StepName,
        status: StepStatus,
        message: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let current = self
            .load_steps(request_id)
            .await?
            .into_iter()
            .find(|(name, _)| *name == step)
            .map(|(_, record)| record.status)
            .ok_or_else(|| DesignLensError::NotFound(format!("request {request_id}")))?;

        if !current.can_transition_to(status) {
            return Err(DesignLensError::validation(format!(
                "step {step} of {request_id} cannot move from {current} to {status}"
            )));
        }

        let overall = self.overall_status(request_id).await?;
        let next_overall = next_overall_status(overall, step, status).unwrap_or(overall);

        let now = now_string();
        let started_at = (status == StepStatus::Processing).then_some(now.as_str());
        let completed_at = status.is_terminal().then_some(now.as_str());

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "UPDATE analysis_steps
             SET status = ?1,
                 message = ?2,
                 started_at = COALESCE(started_at, ?3),
                 completed_at = COALESCE(?4, completed_at)
             WHERE request_id = ?5 AND step = ?6",
            params![
                status.as_str(),
                message,
                started_at,
                completed_at,
                request_id.as_str(),
                step.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;
        tx.execute(
            "UPDATE analysis_requests SET overall_status = ?1, updated_at = ?2 WHERE request_id = ?3",
            params![next_overall.as_str(), now.as_str(), request_id.as_str()],
        )
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        debug!(%request_id, %step, %status, "step updated");
        Ok(())
    }

    async fn update_result_pointer(&self, request_id: &RequestId, pointer: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let changed = self
            .conn
            .execute(
                "UPDATE analysis_requests SET result_data = ?1, updated_at = ?2 WHERE request_id = ?3",
                params![pointer, now_string(), request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(DesignLensError::NotFound(format!("request {request_id}")));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        request_id: &RequestId,
        kind: FailureKind,
        message: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let overall = self.overall_status(request_id).await?;
        self.conn
            .execute(
                "UPDATE analysis_requests SET failure_kind = ?1, failure_message = ?2
                 WHERE request_id = ?3",
                params![kind.as_str(), message, request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        if overall.can_transition_to(StepStatus::Failed) {
            self.set_overall_status(request_id, StepStatus::Failed).await?;
        }
        self.touch(request_id).await
    }

    async fn record_storage_error(&self, request_id: &RequestId, message: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        self.conn
            .execute(
                "UPDATE analysis_requests SET storage_error = ?1, updated_at = ?2 WHERE request_id = ?3",
                params![message, now_string(), request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, request_id: &RequestId) -> Result<Option<TrackingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT request_id, source_ref, implementation, overall_status, result_data,
                        failure_kind, failure_message, storage_error, created_at, updated_at
                 FROM analysis_requests WHERE request_id = ?1",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let mut record = row_to_record(&row)?;
        record.steps = self.load_steps(request_id).await?.into_iter().collect();
        Ok(Some(record))
    }

    async fn list(&self, limit: usize) -> Result<Vec<TrackingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT request_id, source_ref, implementation, overall_status, result_data,
                        failure_kind, failure_message, storage_error, created_at, updated_at
                 FROM analysis_requests
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(row_to_record(&row)?);
        }
        for record in &mut records {
            record.steps = self.load_steps(&record.request_id).await?.into_iter().collect();
        }
        Ok(records)
    }

    async fn delete(&self, request_id: &RequestId) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        self.conn
            .execute(
                "DELETE FROM analysis_steps WHERE request_id = ?1",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM analysis_requests WHERE request_id = ?1",
                params![request_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn storage_err(e: libsql::Error) -> DesignLensError {
    DesignLensError::Storage(e.to_string())
}

fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed precision keeps lexicographic order equal to time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_string() -> String {
    format_timestamp(&Utc::now())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DesignLensError::Storage(format!("invalid date '{s}': {e}")))
}

fn opt_timestamp(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    match row.get::<String>(idx).ok() {
        Some(s) => parse_timestamp(&s).map(Some),
        None => Ok(None),
    }
}

/// Convert a request row to a [`TrackingRecord`] without its steps.
fn row_to_record(row: &libsql::Row) -> Result<TrackingRecord> {
    Ok(TrackingRecord {
        request_id: RequestId::parse(&text(row, 0)?)?,
        source_ref: text(row, 1)?,
        implementation: text(row, 2)?.parse()?,
        overall_status: text(row, 3)?.parse()?,
        steps: Default::default(),
        result_data: text(row, 4)?,
        failure_kind: row
            .get::<String>(5)
            .ok()
            .map(|s| s.parse::<FailureKind>())
            .transpose()?,
        failure_message: row.get::<String>(6).ok(),
        storage_error: row.get::<String>(7).ok(),
        created_at: parse_timestamp(&text(row, 8)?)?,
        updated_at: parse_timestamp(&text(row, 9)?)?,
    })
}
