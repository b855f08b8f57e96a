// SQLite JobStore Implementation

use async_trait::async_trait;
use fhir_export_core::domain::{ExportJob, JobId, JobStatus, JobUpdate};
use fhir_export_core::error::{ExportError, Result};
use fhir_export_core::port::{JobStore, UpdateOutcome};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;

// Helper to convert sqlx::Error to ExportError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> ExportError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => {
                        // UNIQUE / PRIMARY KEY constraint failed
                        ExportError::Conflict(format!(
                            "Unique constraint violation: {} ({})",
                            db_err.message(),
                            code_str
                        ))
                    }
                    "275" => ExportError::Database(format!(
                        "Check constraint violation: {}",
                        db_err.message()
                    )),
                    "5" => ExportError::Database(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => ExportError::Database(format!("Database full: {}", db_err.message())),
                    _ => ExportError::Database(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                ExportError::Database(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => ExportError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            ExportError::Database(format!("Column not found: {}", col))
        }
        // Connection, pool, protocol errors
        _ => ExportError::Database(err.to_string()),
    }
}

fn parse_status(raw: &str) -> Result<JobStatus> {
    JobStatus::from_str(raw)
        .map_err(|_| ExportError::Database(format!("corrupt status column '{}'", raw)))
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &ExportJob) -> Result<JobId> {
        job.check_invariants()?;

        let manifest = job.manifest.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                job_id, owner_id, tenant_id, status, request,
                submitted_at, started_at, completed_at, updated_at,
                runner_handle, output_locations, manifest, error_message,
                ttl_expires_at, start_attempts, next_start_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.owner_id)
        .bind(&job.tenant_id)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.request)?)
        .bind(job.submitted_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(&job.runner_handle)
        .bind(serde_json::to_string(&job.output_locations)?)
        .bind(manifest)
        .bind(&job.error_message)
        .bind(job.ttl_expires_at)
        .bind(i64::from(job.start_attempts))
        .bind(job.next_start_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(job.job_id.clone())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ExportJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM export_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        update: JobUpdate,
    ) -> Result<UpdateOutcome> {
        update.validate_for(expected, new)?;

        let output_locations = update
            .output_locations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let manifest = update.manifest.as_ref().map(serde_json::to_string).transpose()?;

        // The status predicate is the compare-and-swap; set-once fields keep
        // their first value via COALESCE.
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE export_jobs
            SET status = ?,
                updated_at = ?,
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?),
                runner_handle = COALESCE(runner_handle, ?),
                output_locations = COALESCE(?, output_locations),
                manifest = COALESCE(?, manifest),
                error_message = COALESCE(?, error_message),
                start_attempts = COALESCE(?, start_attempts),
                next_start_at = COALESCE(?, next_start_at)
            WHERE job_id = ? AND status = ?
            RETURNING *
            "#,
        )
        .bind(new.as_str())
        .bind(update.at)
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(&update.runner_handle)
        .bind(output_locations)
        .bind(manifest)
        .bind(&update.error_message)
        .bind(update.start_attempts.map(i64::from))
        .bind(update.next_start_at)
        .bind(job_id)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let job = row.into_job()?;
                // Rolled back on drop if the resulting record is inconsistent
                job.check_invariants()?;
                tx.commit().await.map_err(map_sqlx_error)?;
                Ok(UpdateOutcome::Updated(job))
            }
            None => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM export_jobs WHERE job_id = ?")
                        .bind(job_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                tx.rollback().await.map_err(map_sqlx_error)?;

                match current {
                    None => Err(ExportError::NotFound(format!("job {} not found", job_id))),
                    Some(current) => {
                        let current = parse_status(&current)?;
                        debug!(
                            job_id = %job_id,
                            expected = %expected,
                            current = %current,
                            "Compare-and-swap missed"
                        );
                        Ok(UpdateOutcome::Conflict { current })
                    }
                }
            }
        }
    }

    async fn list_by_owner_and_status(
        &self,
        owner_id: &str,
        status: JobStatus,
    ) -> Result<Vec<ExportJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM export_jobs
            WHERE owner_id = ? AND status = ?
            ORDER BY submitted_at ASC, job_id ASC
            "#,
        )
        .bind(owner_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM export_jobs
            WHERE status = ?
            ORDER BY submitted_at ASC, job_id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM export_jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    job_id: String,
    owner_id: String,
    tenant_id: Option<String>,
    status: String,
    request: String,
    submitted_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
    runner_handle: Option<String>,
    output_locations: String,
    manifest: Option<String>,
    error_message: Option<String>,
    ttl_expires_at: i64,
    start_attempts: i64,
    next_start_at: Option<i64>,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<ExportJob> {
        let manifest = self
            .manifest
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ExportJob {
            status: parse_status(&self.status)?,
            request: serde_json::from_str(&self.request)?,
            output_locations: serde_json::from_str(&self.output_locations)?,
            manifest,
            start_attempts: u32::try_from(self.start_attempts).map_err(|_| {
                ExportError::Database(format!(
                    "corrupt start_attempts {} for job {}",
                    self.start_attempts, self.job_id
                ))
            })?,
            job_id: self.job_id,
            owner_id: self.owner_id,
            tenant_id: self.tenant_id,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            runner_handle: self.runner_handle,
            error_message: self.error_message,
            ttl_expires_at: self.ttl_expires_at,
            next_start_at: self.next_start_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use fhir_export_core::domain::{ExportRequest, Manifest, ManifestEntry, NDJSON_CONTENT_TYPE};

    async fn setup_test_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn new_job(id: &str, owner: &str, submitted_at: i64) -> ExportJob {
        ExportJob::new(
            id,
            owner,
            Some("tenant-a".to_string()),
            ExportRequest::new("Patient/123".parse().unwrap())
                .with_resource_types(["Patient", "Observation"])
                .with_since(500),
            submitted_at,
            100_000,
        )
    }

    fn manifest() -> Manifest {
        Manifest {
            entries: vec![ManifestEntry {
                url: "https://signed.test/results/job-1/Patient.ndjson?sig=abc".to_string(),
                content_type: NDJSON_CONTENT_TYPE.to_string(),
                size_bytes: 1024,
                resource_type: Some("Patient".to_string()),
            }],
            expires_at: 9_000,
            signed_by: "export-results-signer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteJobStore::new(setup_test_db().await);
        let job = new_job("job-1", "alice", 1_000);

        assert_eq!(store.create(&job).await.unwrap(), "job-1");

        let found = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let store = SqliteJobStore::new(setup_test_db().await);
        let job = new_job("job-1", "alice", 1_000);

        store.create(&job).await.unwrap();
        let err = store.create(&job).await.unwrap_err();
        assert!(matches!(err, ExportError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists_fields() {
        let store = SqliteJobStore::new(setup_test_db().await);
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();

        let running = store
            .update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Running,
                JobUpdate::started(2_000, "run-1"),
            )
            .await
            .unwrap();
        assert!(running.is_updated());

        let outcome = store
            .update_status(
                "job-1",
                JobStatus::Running,
                JobStatus::Completed,
                JobUpdate::completed(
                    3_000,
                    vec!["results/job-1/Patient.ndjson".to_string()],
                    manifest(),
                ),
            )
            .await
            .unwrap();

        let UpdateOutcome::Updated(completed) = outcome else {
            panic!("expected update, got {:?}", outcome);
        };
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.started_at, Some(2_000));
        assert_eq!(completed.completed_at, Some(3_000));
        assert_eq!(completed.updated_at, 3_000);
        assert_eq!(completed.runner_handle.as_deref(), Some("run-1"));
        assert_eq!(completed.manifest, Some(manifest()));

        let reloaded = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(reloaded, completed);
    }

    #[tokio::test]
    async fn test_stale_expected_status_is_conflict_without_write() {
        let store = SqliteJobStore::new(setup_test_db().await);
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();
        store
            .update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Canceled,
                JobUpdate::canceled(2_000),
            )
            .await
            .unwrap();

        let outcome = store
            .update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Running,
                JobUpdate::started(3_000, "run-1"),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Conflict {
                current: JobStatus::Canceled
            }
        );

        let job = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.runner_handle.is_none());
        assert_eq!(job.updated_at, 2_000);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let store = SqliteJobStore::new(setup_test_db().await);
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();

        let err = store
            .update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Completed,
                JobUpdate::completed(2_000, vec!["results/job-1/a.ndjson".into()], manifest()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Domain(_)));
        assert_eq!(
            store.get("job-1").await.unwrap().unwrap().status,
            JobStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let store = SqliteJobStore::new(setup_test_db().await);
        let err = store
            .update_status(
                "missing",
                JobStatus::Submitted,
                JobStatus::Canceled,
                JobUpdate::canceled(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_deferral_keeps_status() {
        let store = SqliteJobStore::new(setup_test_db().await);
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();

        store
            .update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Submitted,
                JobUpdate::start_deferred(1_500, 2, 31_500),
            )
            .await
            .unwrap();

        let job = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.start_attempts, 2);
        assert_eq!(job.next_start_at, Some(31_500));
    }

    #[tokio::test]
    async fn test_concurrent_swaps_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = SqliteJobStore::new(pool);
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();

        let (a, b) = tokio::join!(
            store.update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Running,
                JobUpdate::started(2_000, "run-a"),
            ),
            store.update_status(
                "job-1",
                JobStatus::Submitted,
                JobStatus::Canceled,
                JobUpdate::canceled(2_000),
            )
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_updated()).count(), 1);
        let winner = store.get("job-1").await.unwrap().unwrap().status;
        let loser = outcomes
            .iter()
            .find_map(|o| match o {
                UpdateOutcome::Conflict { current } => Some(*current),
                UpdateOutcome::Updated(_) => None,
            })
            .unwrap();
        assert_eq!(loser, winner);
    }

    #[tokio::test]
    async fn test_listing_and_counts() {
        let store = SqliteJobStore::new(setup_test_db().await);
        store.create(&new_job("job-2", "alice", 2_000)).await.unwrap();
        store.create(&new_job("job-1", "alice", 1_000)).await.unwrap();
        store.create(&new_job("job-3", "bob", 3_000)).await.unwrap();
        store
            .update_status(
                "job-3",
                JobStatus::Submitted,
                JobStatus::Running,
                JobUpdate::started(4_000, "run-3"),
            )
            .await
            .unwrap();

        let submitted = store.list_by_status(JobStatus::Submitted).await.unwrap();
        let ids: Vec<&str> = submitted.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job-1", "job-2"]);

        let bobs = store
            .list_by_owner_and_status("bob", JobStatus::Running)
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert!(store
            .list_by_owner_and_status("alice", JobStatus::Running)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.count_by_status(JobStatus::Submitted).await.unwrap(), 2);
        assert_eq!(store.count_by_status(JobStatus::Running).await.unwrap(), 1);
    }
}
