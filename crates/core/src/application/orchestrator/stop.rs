// Stop use case: cooperative cancellation

use super::ExportOrchestrator;
use crate::application::access::Operation;
use crate::application::constants::STOP_RACE_RETRIES;
use crate::domain::{ExportJob, JobId, JobStatus, JobUpdate, RequesterIdentity};
use crate::error::{ExportError, Result};
use crate::port::{StopOutcome, UpdateOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Stop accepted; `status` is CANCELED or CANCELING
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopAcknowledgement {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl ExportOrchestrator {
    /// Request cancellation of an export
    ///
    /// SUBMITTED jobs are canceled directly without involving the runner.
    /// RUNNING jobs move to CANCELING and the runner is asked to stop; the
    /// scheduled advance confirms the stop and finishes the cancellation.
    ///
    /// # Errors
    /// - `ExportError::NotFound` / `ExportError::Forbidden`
    /// - `ExportError::Conflict` if the job is already terminal
    pub async fn stop_export(
        &self,
        requester: &RequesterIdentity,
        job_id: &str,
    ) -> Result<StopAcknowledgement> {
        let mut job = self.load(job_id).await?;
        self.access
            .authorize(requester, &job, Operation::Stop)
            .into_result()?;

        for _ in 0..STOP_RACE_RETRIES {
            let now = self.time_provider.now_millis();
            match job.status {
                JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => {
                    return Err(ExportError::Conflict(format!(
                        "export job {} is already {}",
                        job.job_id, job.status
                    )));
                }
                JobStatus::Submitted => {
                    let outcome = self
                        .transition(
                            &job,
                            JobStatus::Submitted,
                            JobStatus::Canceled,
                            JobUpdate::canceled(now),
                        )
                        .await?;
                    if outcome.is_updated() {
                        info!(job_id = %job.job_id, "Export job canceled before it ran");
                        return Ok(self.acknowledge(&job, JobStatus::Canceled));
                    }
                }
                JobStatus::Running => {
                    let outcome = self
                        .transition(
                            &job,
                            JobStatus::Running,
                            JobStatus::Canceling,
                            JobUpdate::touch(now),
                        )
                        .await?;
                    if let UpdateOutcome::Updated(canceling) = outcome {
                        self.request_runner_stop(&canceling).await;
                        return Ok(self.acknowledge(&canceling, JobStatus::Canceling));
                    }
                }
                JobStatus::Canceling => {
                    self.request_runner_stop(&job).await;
                    return Ok(self.acknowledge(&job, JobStatus::Canceling));
                }
            }

            // Lost a race; decide again on the fresh record
            job = self.load(job_id).await?;
        }

        Err(ExportError::Conflict(format!(
            "export job {} kept changing, retry the stop request",
            job_id
        )))
    }

    async fn request_runner_stop(&self, job: &ExportJob) {
        let Some(handle) = job.runner_handle.as_deref() else {
            return;
        };

        match self.bounded("runner stop", self.runner.stop(handle)).await {
            Ok(Ok(StopOutcome::Acknowledged)) => {
                info!(job_id = %job.job_id, "Runner acknowledged stop")
            }
            Ok(Ok(StopOutcome::AlreadyTerminal)) => {
                debug!(job_id = %job.job_id, "Runner execution already ended")
            }
            Ok(Err(e)) => warn!(
                job_id = %job.job_id,
                error = %e,
                "Runner stop failed, scheduled advance will re-issue it"
            ),
            Err(e) => warn!(
                job_id = %job.job_id,
                error = %e,
                "Runner stop timed out, scheduled advance will re-issue it"
            ),
        }
    }

    fn acknowledge(&self, job: &ExportJob, status: JobStatus) -> StopAcknowledgement {
        StopAcknowledgement {
            job_id: job.job_id.clone(),
            status,
        }
    }
}
