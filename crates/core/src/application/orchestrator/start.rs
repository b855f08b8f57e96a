// Start use case: authorize, validate, persist, hand off to the runner

use super::{AdvanceOutcome, ExportOrchestrator};
use crate::application::access::Operation;
use crate::application::retry::RetryDecision;
use crate::domain::{ExportJob, ExportRequest, JobId, JobStatus, JobUpdate, RequesterIdentity};
use crate::error::{ExportError, Result};
use crate::port::UpdateOutcome;
use tracing::{debug, info, warn};

impl ExportOrchestrator {
    /// Submit a new export
    ///
    /// Returns the job id whenever a job was created, even if the runner could
    /// not take it yet (the job stays SUBMITTED and is retried by the
    /// scheduled trigger).
    ///
    /// # Errors
    /// - `ExportError::Forbidden` if the requester may not export this scope
    /// - `ExportError::InvalidRequest` for malformed filters
    pub async fn start_export(
        &self,
        requester: &RequesterIdentity,
        request: ExportRequest,
    ) -> Result<JobId> {
        let now = self.time_provider.now_millis();
        let tenant_id = if self.config.enable_multi_tenancy {
            requester.tenant_id.clone()
        } else {
            None
        };

        let mut job = ExportJob::new(
            self.id_provider.generate_id(),
            requester.owner_id.clone(),
            tenant_id,
            request,
            now,
            self.config.job_ttl_ms,
        );

        self.access
            .authorize(requester, &job, Operation::Start)
            .into_result()?;

        job.request = job
            .request
            .normalized(now)
            .map_err(|e| ExportError::InvalidRequest(e.to_string()))?;

        let job_id = self
            .bounded("job store create", self.store.create(&job))
            .await??;

        info!(
            job_id = %job_id,
            owner_id = %job.owner_id,
            scope = %job.request.scope,
            types = ?job.request.resource_types,
            "Export job submitted"
        );

        match self.attempt_start(&job).await {
            Ok(outcome) => debug!(job_id = %job_id, outcome = ?outcome, "Initial runner start"),
            Err(e) => warn!(
                job_id = %job_id,
                error = %e,
                "Initial runner start did not complete, scheduled advance will retry"
            ),
        }

        Ok(job_id)
    }

    /// Ask the runner to start a SUBMITTED job and record the result
    pub(super) async fn attempt_start(&self, job: &ExportJob) -> Result<AdvanceOutcome> {
        let params = self.runner_parameters(job);

        let started = match self.bounded("runner start", self.runner.start(&params)).await {
            Ok(started) => started,
            Err(timeout) => return self.defer_start(job, timeout.to_string()).await,
        };

        match started {
            Ok(handle) => {
                let now = self.time_provider.now_millis();
                let outcome = self
                    .transition(
                        job,
                        JobStatus::Submitted,
                        JobStatus::Running,
                        JobUpdate::started(now, handle.clone()),
                    )
                    .await?;

                if let UpdateOutcome::Conflict { current } = &outcome {
                    if self.records_handle(&job.job_id, &handle).await {
                        // Started elsewhere on the same execution
                        debug!(job_id = %job.job_id, handle = %handle, "Start already recorded by another worker");
                    } else {
                        // Canceled or started elsewhere meanwhile; nobody owns this execution
                        debug!(
                            job_id = %job.job_id,
                            current = %current,
                            handle = %handle,
                            "Start lost race, stopping orphaned runner execution"
                        );
                        self.stop_orphan(&job.job_id, &handle).await;
                    }
                }

                Ok(AdvanceOutcome::from_update(
                    JobStatus::Submitted,
                    JobStatus::Running,
                    outcome,
                ))
            }
            Err(e) if e.is_transient() => self.defer_start(job, e.to_string()).await,
            Err(e) => {
                self.fail(job, JobStatus::Submitted, format!("runner rejected export: {}", e))
                    .await
            }
        }
    }

    /// Record a failed start attempt and schedule the next one (or give up)
    async fn defer_start(&self, job: &ExportJob, reason: String) -> Result<AdvanceOutcome> {
        let attempts = job.start_attempts + 1;

        match self.retry_policy.decide(&job.job_id, attempts) {
            RetryDecision::Retry(delay_ms) => {
                let now = self.time_provider.now_millis();
                let next_start_at = now + delay_ms;
                warn!(
                    job_id = %job.job_id,
                    attempts = attempts,
                    next_start_at = next_start_at,
                    reason = %reason,
                    "Runner unavailable, start deferred"
                );
                let outcome = self
                    .transition(
                        job,
                        JobStatus::Submitted,
                        JobStatus::Submitted,
                        JobUpdate::start_deferred(now, attempts, next_start_at),
                    )
                    .await?;
                Ok(match outcome {
                    UpdateOutcome::Updated(_) => AdvanceOutcome::StartDeferred {
                        attempts,
                        next_start_at,
                    },
                    UpdateOutcome::Conflict { current } => AdvanceOutcome::Conflict { current },
                })
            }
            RetryDecision::GiveUp => {
                self.fail(
                    job,
                    JobStatus::Submitted,
                    format!(
                        "runner unavailable after {} start attempts: {}",
                        attempts, reason
                    ),
                )
                .await
            }
        }
    }

    /// Whether the stored job already points at `handle`
    ///
    /// The runner hands out one handle per job, so a winner of the start race
    /// may have recorded the very execution this worker got back.
    async fn records_handle(&self, job_id: &str, handle: &str) -> bool {
        match self.bounded("job store get", self.store.get(job_id)).await {
            Ok(Ok(Some(current))) => current.runner_handle.as_deref() == Some(handle),
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Could not re-read job after lost start race");
                true
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not re-read job after lost start race");
                true
            }
        }
    }

    async fn stop_orphan(&self, job_id: &str, handle: &str) {
        match self.bounded("runner stop", self.runner.stop(handle)).await {
            Ok(Ok(outcome)) => {
                debug!(job_id = %job_id, handle = %handle, outcome = ?outcome, "Orphaned execution stopped")
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, handle = %handle, error = %e, "Could not stop orphaned execution")
            }
            Err(e) => {
                warn!(job_id = %job_id, handle = %handle, error = %e, "Could not stop orphaned execution")
            }
        }
    }
}
