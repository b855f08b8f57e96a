// SQLite Maintenance Implementation (retention)
use crate::job_store::{map_sqlx_error, JobRow};
use async_trait::async_trait;
use fhir_export_core::domain::{ExportJob, JobStatus};
use fhir_export_core::error::{ExportError, Result};
use fhir_export_core::port::{Maintenance, MaintenanceStats};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// SQLite maintenance implementation
pub struct SqliteMaintenance {
    pool: SqlitePool,
}

// Terminal status list bound into every retention query
const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled];

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get DB size in bytes
    async fn get_db_size(&self) -> Result<i64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ExportError::Internal(format!("Failed to get page count: {}", e)))?;

        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ExportError::Internal(format!("Failed to get page size: {}", e)))?;

        Ok(page_count * page_size)
    }

    /// Reclaim free pages after large sweeps
    pub async fn vacuum(&self) -> Result<i64> {
        let before = self.get_db_size().await?;
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(|e| ExportError::Internal(format!("VACUUM failed: {}", e)))?;
        let after = self.get_db_size().await?;
        let reclaimed = (before - after).max(0);

        info!(
            size_before_bytes = before,
            size_after_bytes = after,
            reclaimed_bytes = reclaimed,
            "VACUUM completed"
        );
        Ok(reclaimed)
    }
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn find_expired(&self, now: i64, limit: i64) -> Result<Vec<ExportJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM export_jobs
            WHERE status IN (?, ?, ?)
              AND ttl_expires_at <= ?
            ORDER BY ttl_expires_at ASC, job_id ASC
            LIMIT ?
            "#,
        )
        .bind(TERMINAL[0].as_str())
        .bind(TERMINAL[1].as_str())
        .bind(TERMINAL[2].as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn delete_expired(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM export_jobs
            WHERE job_id = ?
              AND status IN (?, ?, ?)
              AND ttl_expires_at <= ?
            "#,
        )
        .bind(job_id)
        .bind(TERMINAL[0].as_str())
        .bind(TERMINAL[1].as_str())
        .bind(TERMINAL[2].as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = result.rows_affected() > 0;
        debug!(job_id = %job_id, deleted = deleted, "Expired job delete");
        Ok(deleted)
    }

    async fn get_stats(&self, now: i64) -> Result<MaintenanceStats> {
        let db_size_bytes = self.get_db_size().await?;

        let job_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM export_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let (terminal_job_count, expired_job_count): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN ttl_expires_at <= ? THEN 1 ELSE 0 END), 0)
            FROM export_jobs
            WHERE status IN (?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(TERMINAL[0].as_str())
        .bind(TERMINAL[1].as_str())
        .bind(TERMINAL[2].as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(MaintenanceStats {
            db_size_bytes,
            job_count,
            terminal_job_count,
            expired_job_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, SqliteJobStore};
    use fhir_export_core::domain::{ExportRequest, JobUpdate};
    use fhir_export_core::port::JobStore;

    const TTL: i64 = 10_000;

    async fn setup() -> (SqliteJobStore, SqliteMaintenance) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        (SqliteJobStore::new(pool.clone()), SqliteMaintenance::new(pool))
    }

    async fn insert(store: &SqliteJobStore, id: &str, submitted_at: i64, cancel: bool) {
        let job = ExportJob::new(
            id,
            "alice",
            None,
            ExportRequest::new("Patient".parse().unwrap()),
            submitted_at,
            TTL,
        );
        store.create(&job).await.unwrap();
        if cancel {
            store
                .update_status(
                    id,
                    JobStatus::Submitted,
                    JobStatus::Canceled,
                    JobUpdate::canceled(submitted_at + 1),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_maintenance_stats() {
        let (store, maintenance) = setup().await;
        insert(&store, "old", 0, true).await;
        insert(&store, "new", 5_000, true).await;
        insert(&store, "active", 0, false).await;

        let stats = maintenance.get_stats(TTL).await.unwrap();
        assert!(stats.db_size_bytes > 0);
        assert_eq!(stats.job_count, 3);
        assert_eq!(stats.terminal_job_count, 2);
        assert_eq!(stats.expired_job_count, 1);
    }

    #[tokio::test]
    async fn test_find_expired_skips_active_jobs() {
        let (store, maintenance) = setup().await;
        insert(&store, "old", 0, true).await;
        insert(&store, "active", 0, false).await;
        insert(&store, "new", 5_000, true).await;

        let expired = maintenance.find_expired(TTL, 100).await.unwrap();
        let ids: Vec<&str> = expired.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);

        assert!(maintenance.find_expired(TTL + 5_000, 1).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_delete_expired_rechecks_eligibility() {
        let (store, maintenance) = setup().await;
        insert(&store, "old", 0, true).await;
        insert(&store, "active", 0, false).await;

        assert!(!maintenance.delete_expired("old", TTL - 1).await.unwrap());
        assert!(!maintenance.delete_expired("active", TTL).await.unwrap());
        assert!(maintenance.delete_expired("old", TTL).await.unwrap());
        assert!(!maintenance.delete_expired("old", TTL).await.unwrap());

        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("active").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_vacuum() {
        let (_, maintenance) = setup().await;
        let reclaimed = maintenance.vacuum().await.unwrap();
        assert!(reclaimed >= 0);
    }
}
