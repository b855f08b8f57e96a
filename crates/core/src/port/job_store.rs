// Job Store Port (Interface)

use crate::domain::{ExportJob, JobId, JobStatus, JobUpdate};
use crate::error::Result;
use async_trait::async_trait;

/// Outcome of a conditional status write
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The write was applied; carries the job as persisted
    Updated(ExportJob),
    /// Persisted status differed from the expected one; nothing was written
    Conflict { current: JobStatus },
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Durable record of every export job
///
/// All status changes go through `update_status`, a compare-and-swap on the
/// persisted status. It is the single point of serialization for a job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job
    ///
    /// # Errors
    /// `ExportError::Conflict` if the job id already exists
    async fn create(&self, job: &ExportJob) -> Result<JobId>;

    /// Find job by ID
    async fn get(&self, job_id: &str) -> Result<Option<ExportJob>>;

    /// Conditionally move a job from `expected` to `new`
    ///
    /// # Arguments
    /// * `job_id` - Job to update
    /// * `expected` - Status the caller observed
    /// * `new` - Target status (must be a legal transition from `expected`)
    /// * `update` - Fields written together with the status
    ///
    /// # Errors
    /// - `ExportError::NotFound` if the job does not exist
    /// - `ExportError::Domain` if the transition or update is illegal
    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        update: JobUpdate,
    ) -> Result<UpdateOutcome>;

    /// Jobs of one owner in one status (served by the status/owner index)
    async fn list_by_owner_and_status(
        &self,
        owner_id: &str,
        status: JobStatus,
    ) -> Result<Vec<ExportJob>>;

    /// All jobs in a status, oldest first
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>>;

    /// Count jobs by status
    async fn count_by_status(&self, status: JobStatus) -> Result<i64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::ExportError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory JobStore with a write counter
    #[derive(Default)]
    pub struct InMemoryJobStore {
        jobs: Mutex<HashMap<JobId, ExportJob>>,
        writes: AtomicUsize,
        conflicts: AtomicUsize,
    }

    impl InMemoryJobStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of successful `create` + `update_status` writes
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        /// Number of `update_status` calls that lost the compare-and-swap
        pub fn conflicts(&self) -> usize {
            self.conflicts.load(Ordering::SeqCst)
        }

        /// Overwrite a record directly (test setup only)
        pub fn put(&self, job: ExportJob) {
            self.jobs.lock().unwrap().insert(job.job_id.clone(), job);
        }

        fn sorted(mut jobs: Vec<ExportJob>) -> Vec<ExportJob> {
            jobs.sort_by(|a, b| {
                a.submitted_at
                    .cmp(&b.submitted_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            jobs
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn create(&self, job: &ExportJob) -> Result<JobId> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.job_id) {
                return Err(ExportError::Conflict(format!(
                    "job {} already exists",
                    job.job_id
                )));
            }
            jobs.insert(job.job_id.clone(), job.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(job.job_id.clone())
        }

        async fn get(&self, job_id: &str) -> Result<Option<ExportJob>> {
            Ok(self.jobs.lock().unwrap().get(job_id).cloned())
        }

        async fn update_status(
            &self,
            job_id: &str,
            expected: JobStatus,
            new: JobStatus,
            update: JobUpdate,
        ) -> Result<UpdateOutcome> {
            update.validate_for(expected, new)?;

            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| ExportError::NotFound(format!("job {} not found", job_id)))?;

            if job.status != expected {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                return Ok(UpdateOutcome::Conflict {
                    current: job.status,
                });
            }

            let mut next = job.clone();
            next.apply(new, &update)?;
            *job = next.clone();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateOutcome::Updated(next))
        }

        async fn list_by_owner_and_status(
            &self,
            owner_id: &str,
            status: JobStatus,
        ) -> Result<Vec<ExportJob>> {
            let jobs = self.jobs.lock().unwrap();
            Ok(Self::sorted(
                jobs.values()
                    .filter(|j| j.owner_id == owner_id && j.status == status)
                    .cloned()
                    .collect(),
            ))
        }

        async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>> {
            let jobs = self.jobs.lock().unwrap();
            Ok(Self::sorted(
                jobs.values().filter(|j| j.status == status).cloned().collect(),
            ))
        }

        async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs.values().filter(|j| j.status == status).count() as i64)
        }
    }
}
