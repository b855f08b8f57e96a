// Retention maintenance port
use crate::domain::ExportJob;
use crate::error::Result;
use async_trait::async_trait;

/// Job store statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceStats {
    pub db_size_bytes: i64,
    pub job_count: i64,
    pub terminal_job_count: i64,
    /// Terminal jobs whose TTL has passed and await the sweeper
    pub expired_job_count: i64,
}

/// Retention sweep configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Maximum records reclaimed per sweep pass
    pub batch_size: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// Record reclamation, independent of orchestration
///
/// Only terminal jobs are ever reclaimed.
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Terminal jobs with `ttl_expires_at <= now`, oldest first
    ///
    /// # Arguments
    /// * `now` - Current time (epoch ms)
    /// * `limit` - Maximum number of jobs returned
    async fn find_expired(&self, now: i64, limit: i64) -> Result<Vec<ExportJob>>;

    /// Delete one expired terminal record
    ///
    /// # Returns
    /// false if the record is gone or no longer eligible
    async fn delete_expired(&self, job_id: &str, now: i64) -> Result<bool>;

    /// Get maintenance statistics
    async fn get_stats(&self, now: i64) -> Result<MaintenanceStats>;
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Maintenance over a plain list of records
    #[derive(Default)]
    pub struct InMemoryMaintenance {
        jobs: Mutex<Vec<ExportJob>>,
    }

    impl InMemoryMaintenance {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, job: ExportJob) {
            self.jobs.lock().unwrap().push(job);
        }

        pub fn job_ids(&self) -> Vec<String> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .map(|j| j.job_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Maintenance for InMemoryMaintenance {
        async fn find_expired(&self, now: i64, limit: i64) -> Result<Vec<ExportJob>> {
            let mut expired: Vec<ExportJob> = self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.status.is_terminal() && j.ttl_expires_at <= now)
                .cloned()
                .collect();
            expired.sort_by_key(|j| j.ttl_expires_at);
            expired.truncate(limit.max(0) as usize);
            Ok(expired)
        }

        async fn delete_expired(&self, job_id: &str, now: i64) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|j| {
                !(j.job_id == job_id && j.status.is_terminal() && j.ttl_expires_at <= now)
            });
            Ok(jobs.len() < before)
        }

        async fn get_stats(&self, now: i64) -> Result<MaintenanceStats> {
            let jobs = self.jobs.lock().unwrap();
            let terminal = jobs.iter().filter(|j| j.status.is_terminal());
            Ok(MaintenanceStats {
                db_size_bytes: 0,
                job_count: jobs.len() as i64,
                terminal_job_count: terminal.clone().count() as i64,
                expired_job_count: terminal.filter(|j| j.ttl_expires_at <= now).count() as i64,
            })
        }
    }
}
