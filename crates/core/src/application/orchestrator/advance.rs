// Advance use case: poll the runner and move jobs forward

use super::ExportOrchestrator;
use crate::application::retry::is_age_exceeded;
use crate::domain::{ExportJob, JobStatus, JobUpdate};
use crate::error::Result;
use crate::port::{RunnerStatus, StopOutcome, UpdateOutcome};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

/// What one advance did to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Job is terminal; nothing to do
    NoOp,
    /// Nothing changed this pass (runner busy, retry not due, transient error)
    Unchanged,
    /// Runner was unavailable; start retry scheduled
    StartDeferred { attempts: u32, next_start_at: i64 },
    Transitioned { from: JobStatus, to: JobStatus },
    /// Another writer changed the job first; nothing was written
    Conflict { current: JobStatus },
}

impl AdvanceOutcome {
    pub(super) fn from_update(from: JobStatus, to: JobStatus, outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Updated(_) => AdvanceOutcome::Transitioned { from, to },
            UpdateOutcome::Conflict { current } => AdvanceOutcome::Conflict { current },
        }
    }
}

/// Tally of one scheduled pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    pub examined: usize,
    pub transitioned: usize,
    pub unchanged: usize,
    pub deferred: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl AdvanceReport {
    fn record(&mut self, outcome: &AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::Transitioned { .. } => self.transitioned += 1,
            AdvanceOutcome::StartDeferred { .. } => self.deferred += 1,
            AdvanceOutcome::Conflict { .. } => self.conflicts += 1,
            AdvanceOutcome::NoOp | AdvanceOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

impl ExportOrchestrator {
    /// Advance one job by id
    ///
    /// Terminal jobs are a no-op; repeating an advance is always safe.
    ///
    /// # Errors
    /// - `ExportError::NotFound` for unknown ids
    /// - infrastructure errors from the store (the job is left untouched)
    pub async fn advance_job(&self, job_id: &str) -> Result<AdvanceOutcome> {
        let job = self.load(job_id).await?;
        self.advance_loaded(&job).await
    }

    /// Scheduled trigger: advance every running, canceling and due submitted job
    ///
    /// Jobs are advanced with bounded concurrency; a failing job is logged and
    /// counted, never aborting the pass.
    pub async fn advance_all(&self) -> Result<AdvanceReport> {
        let now = self.time_provider.now_millis();
        let mut report = AdvanceReport::default();
        let mut candidates: Vec<ExportJob> = Vec::new();

        for status in [JobStatus::Running, JobStatus::Canceling, JobStatus::Submitted] {
            let listed = self
                .bounded("job store list", self.store.list_by_status(status))
                .await
                .and_then(|inner| inner);
            match listed {
                Ok(jobs) => candidates.extend(jobs.into_iter().filter(|job| {
                    status != JobStatus::Submitted
                        || job.is_start_due(now)
                        || job.age_ms(now) > self.config.max_job_age_ms
                })),
                Err(e) => {
                    error!(status = %status, error = %e, "Failed to list jobs for scheduled advance");
                    report.errors += 1;
                }
            }
        }

        report.examined = candidates.len();

        let outcomes: Vec<(String, Result<AdvanceOutcome>)> = stream::iter(candidates)
            .map(|job| async move {
                let outcome = self.advance_loaded(&job).await;
                (job.job_id, outcome)
            })
            .buffer_unordered(self.config.advance_concurrency)
            .collect()
            .await;

        for (job_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Advancing export job failed");
                    report.errors += 1;
                }
            }
        }

        if report.examined > 0 || report.errors > 0 {
            info!(
                examined = report.examined,
                transitioned = report.transitioned,
                deferred = report.deferred,
                conflicts = report.conflicts,
                errors = report.errors,
                "Scheduled advance pass finished"
            );
        } else {
            debug!("Scheduled advance pass found no active jobs");
        }

        Ok(report)
    }

    pub(super) async fn advance_loaded(&self, job: &ExportJob) -> Result<AdvanceOutcome> {
        let now = self.time_provider.now_millis();
        match job.status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => Ok(AdvanceOutcome::NoOp),
            JobStatus::Submitted => self.advance_submitted(job, now).await,
            JobStatus::Running => self.advance_running(job, now).await,
            JobStatus::Canceling => self.advance_canceling(job, now).await,
        }
    }

    async fn advance_submitted(&self, job: &ExportJob, now: i64) -> Result<AdvanceOutcome> {
        if is_age_exceeded(job, now, self.config.max_job_age_ms) {
            return self
                .fail(
                    job,
                    JobStatus::Submitted,
                    format!(
                        "export timed out before the runner accepted it (maximum age {}ms)",
                        self.config.max_job_age_ms
                    ),
                )
                .await;
        }
        if !job.is_start_due(now) {
            return Ok(AdvanceOutcome::Unchanged);
        }
        self.attempt_start(job).await
    }

    async fn advance_running(&self, job: &ExportJob, now: i64) -> Result<AdvanceOutcome> {
        let Some(handle) = job.runner_handle.as_deref() else {
            return self
                .fail(job, JobStatus::Running, "running job has no runner handle")
                .await;
        };

        if is_age_exceeded(job, now, self.config.max_job_age_ms) {
            let outcome = self
                .fail(
                    job,
                    JobStatus::Running,
                    format!(
                        "export timed out after {}ms (maximum age {}ms)",
                        job.age_ms(now),
                        self.config.max_job_age_ms
                    ),
                )
                .await?;
            if matches!(outcome, AdvanceOutcome::Transitioned { .. }) {
                // Best effort; the job is already failed
                match self.bounded("runner stop", self.runner.stop(handle)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!(job_id = %job.job_id, error = %e, "Could not stop timed-out runner execution");
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "Could not stop timed-out runner execution");
                    }
                }
            }
            return Ok(outcome);
        }

        let polled = match self.bounded("runner poll", self.runner.poll(handle)).await {
            Ok(polled) => polled,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Runner poll timed out, will retry");
                return Ok(AdvanceOutcome::Unchanged);
            }
        };

        match polled {
            Ok(RunnerStatus::Running) => Ok(AdvanceOutcome::Unchanged),
            Ok(RunnerStatus::Succeeded(locations)) => self.complete(job, locations).await,
            Ok(RunnerStatus::Failed(reason)) => {
                self.fail(job, JobStatus::Running, format!("export extraction failed: {}", reason))
                    .await
            }
            Ok(RunnerStatus::Stopped) => {
                self.fail(
                    job,
                    JobStatus::Running,
                    "runner execution stopped without a stop request",
                )
                .await
            }
            Err(e) if e.is_transient() => {
                warn!(job_id = %job.job_id, error = %e, "Runner unavailable during poll, will retry");
                Ok(AdvanceOutcome::Unchanged)
            }
            Err(e) => {
                self.fail(job, JobStatus::Running, format!("runner poll failed: {}", e))
                    .await
            }
        }
    }

    /// Package results and commit `RUNNING -> COMPLETED`
    async fn complete(&self, job: &ExportJob, locations: Vec<String>) -> Result<AdvanceOutcome> {
        if locations.is_empty() {
            return self
                .fail(
                    job,
                    JobStatus::Running,
                    "runner reported success without any output",
                )
                .await;
        }

        let packaged = match self
            .bounded(
                "result packaging",
                self.packager.package(&locations, &job.owner_id),
            )
            .await
        {
            Ok(packaged) => packaged,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Packaging timed out, will retry");
                return Ok(AdvanceOutcome::Unchanged);
            }
        };

        let manifest = match packaged {
            Ok(manifest) => manifest,
            Err(e) => {
                return self
                    .fail(job, JobStatus::Running, format!("result packaging failed: {}", e))
                    .await
            }
        };

        let now = self.time_provider.now_millis();
        let outcome = self
            .transition(
                job,
                JobStatus::Running,
                JobStatus::Completed,
                JobUpdate::completed(now, locations, manifest),
            )
            .await?;
        if outcome.is_updated() {
            info!(job_id = %job.job_id, owner_id = %job.owner_id, "Export job completed");
        }
        Ok(AdvanceOutcome::from_update(
            JobStatus::Running,
            JobStatus::Completed,
            outcome,
        ))
    }

    async fn advance_canceling(&self, job: &ExportJob, now: i64) -> Result<AdvanceOutcome> {
        let Some(handle) = job.runner_handle.as_deref() else {
            return self.finish_cancel(job).await;
        };

        if is_age_exceeded(job, now, self.config.max_job_age_ms) {
            warn!(job_id = %job.job_id, "Runner never confirmed stop, forcing cancellation");
            return self.finish_cancel(job).await;
        }

        let polled = match self.bounded("runner poll", self.runner.poll(handle)).await {
            Ok(polled) => polled,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Runner poll timed out, will retry");
                return Ok(AdvanceOutcome::Unchanged);
            }
        };

        match polled {
            Ok(RunnerStatus::Running) => {
                // Stop is idempotent; re-issue until the runner confirms
                match self.bounded("runner stop", self.runner.stop(handle)).await {
                    Ok(Ok(StopOutcome::AlreadyTerminal)) => self.finish_cancel(job).await,
                    Ok(Ok(StopOutcome::Acknowledged)) => Ok(AdvanceOutcome::Unchanged),
                    Ok(Err(e)) => {
                        warn!(job_id = %job.job_id, error = %e, "Stop re-issue failed, will retry");
                        Ok(AdvanceOutcome::Unchanged)
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "Stop re-issue timed out, will retry");
                        Ok(AdvanceOutcome::Unchanged)
                    }
                }
            }
            Ok(_) => self.finish_cancel(job).await,
            Err(e) if e.is_transient() => {
                warn!(job_id = %job.job_id, error = %e, "Runner unavailable during poll, will retry");
                Ok(AdvanceOutcome::Unchanged)
            }
            Err(e) => {
                // Nothing the runner knows of is still running
                debug!(job_id = %job.job_id, error = %e, "Runner lost the execution, finishing cancellation");
                self.finish_cancel(job).await
            }
        }
    }

    async fn finish_cancel(&self, job: &ExportJob) -> Result<AdvanceOutcome> {
        let now = self.time_provider.now_millis();
        let outcome = self
            .transition(
                job,
                JobStatus::Canceling,
                JobStatus::Canceled,
                JobUpdate::canceled(now),
            )
            .await?;
        Ok(AdvanceOutcome::from_update(
            JobStatus::Canceling,
            JobStatus::Canceled,
            outcome,
        ))
    }
}
