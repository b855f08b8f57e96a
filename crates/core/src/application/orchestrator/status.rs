// Status use case: read-only job projection for the owner

use super::ExportOrchestrator;
use crate::application::access::Operation;
use crate::domain::{ExportJob, ExportRequest, JobId, JobStatus, Manifest, RequesterIdentity};
use crate::error::Result;
use serde::Serialize;
use tracing::warn;

/// What the owner sees of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub request: ExportRequest,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Present only when COMPLETED; carries its own `expires_at`, which is in
    /// the past if the URLs could not be re-signed
    pub manifest: Option<Manifest>,
    /// Present only when FAILED
    pub error_message: Option<String>,
}

impl JobStatusView {
    fn from_job(job: ExportJob, manifest: Option<Manifest>) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            request: job.request,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            manifest,
            error_message: job.error_message,
        }
    }
}

impl ExportOrchestrator {
    /// Current status of a job, with manifest or failure detail
    ///
    /// Expired manifest URLs are re-signed for the response; nothing is written.
    /// A job whose URLs cannot be re-signed is still reported, with the
    /// expired manifest.
    ///
    /// # Errors
    /// `ExportError::NotFound`, or `ExportError::Forbidden` for anyone but the owner
    pub async fn job_status(
        &self,
        requester: &RequesterIdentity,
        job_id: &str,
    ) -> Result<JobStatusView> {
        let job = self.load(job_id).await?;
        self.access
            .authorize(requester, &job, Operation::Status)
            .into_result()?;
        Ok(self.project(job))
    }

    /// The requester's own jobs in one status
    pub async fn list_jobs(
        &self,
        requester: &RequesterIdentity,
        status: JobStatus,
    ) -> Result<Vec<JobStatusView>> {
        let jobs = self
            .bounded(
                "job store list",
                self.store
                    .list_by_owner_and_status(&requester.owner_id, status),
            )
            .await??;

        Ok(jobs
            .into_iter()
            .filter(|job| {
                self.access
                    .authorize(requester, job, Operation::Status)
                    .is_allowed()
            })
            .map(|job| self.project(job))
            .collect())
    }

    fn project(&self, job: ExportJob) -> JobStatusView {
        let now = self.time_provider.now_millis();
        let manifest = match (&job.manifest, job.status) {
            (Some(manifest), JobStatus::Completed) if manifest.is_expired(now) => {
                match self.packager.refresh(&job.output_locations, manifest) {
                    Ok(refreshed) => Some(refreshed),
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "Could not re-sign expired manifest");
                        Some(manifest.clone())
                    }
                }
            }
            (Some(manifest), JobStatus::Completed) => Some(manifest.clone()),
            _ => None,
        };
        JobStatusView::from_job(job, manifest)
    }
}
