// Export Orchestrator - Drives export jobs through their state machine
//
// Every status change is a compare-and-swap on the job store. Losing a
// swap is normal under concurrency and never an error.

mod advance;
mod start;
mod status;
mod stop;


pub use advance::{AdvanceOutcome, AdvanceReport};
pub use status::JobStatusView;
pub use stop::StopAcknowledgement;

use super::access::AccessGate;
use super::config::OrchestratorConfig;
use super::packager::ResultPackager;
use super::retry::StartRetryPolicy;
use crate::domain::{ExportJob, JobStatus, JobUpdate};
use crate::error::{ExportError, Result};
use crate::port::{IdProvider, JobRunner, JobStore, RunnerParameters, TimeProvider, UpdateOutcome};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Export orchestrator (stateless; safe to share across tasks)
pub struct ExportOrchestrator {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    packager: Arc<ResultPackager>,
    access: AccessGate,
    retry_policy: StartRetryPolicy,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    config: OrchestratorConfig,
}

impl ExportOrchestrator {
    /// Create a new orchestrator
    ///
    /// # Errors
    /// `ExportError::Config` if the configuration is inconsistent
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        packager: Arc<ResultPackager>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            runner,
            packager,
            access: AccessGate::new(config.enable_multi_tenancy),
            retry_policy: StartRetryPolicy::from_config(&config),
            id_provider,
            time_provider,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Key prefix for a job's results inside the results bucket
    pub fn output_prefix(job_id: &str) -> String {
        format!("{}/", job_id)
    }

    /// Bound an adapter call by `call_timeout`
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| {
                ExportError::Timeout(format!(
                    "{} exceeded {}ms",
                    what,
                    self.config.call_timeout.as_millis()
                ))
            })
    }

    async fn load(&self, job_id: &str) -> Result<ExportJob> {
        self.bounded("job store get", self.store.get(job_id))
            .await??
            .ok_or_else(|| ExportError::NotFound(format!("export job {} not found", job_id)))
    }

    /// Compare-and-swap `from -> to`; conflicts are logged at debug
    async fn transition(
        &self,
        job: &ExportJob,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<UpdateOutcome> {
        let outcome = self
            .bounded(
                "job store update",
                self.store.update_status(&job.job_id, from, to, update),
            )
            .await??;

        match &outcome {
            UpdateOutcome::Updated(_) => {
                info!(job_id = %job.job_id, from = %from, to = %to, "Export job transitioned");
            }
            UpdateOutcome::Conflict { current } => {
                debug!(
                    job_id = %job.job_id,
                    expected = %from,
                    current = %current,
                    attempted = %to,
                    "Status write lost race, discarding"
                );
            }
        }
        Ok(outcome)
    }

    /// Move a job to FAILED with `reason`
    async fn fail(
        &self,
        job: &ExportJob,
        from: JobStatus,
        reason: impl Into<String>,
    ) -> Result<AdvanceOutcome> {
        let reason = reason.into();
        let now = self.time_provider.now_millis();
        let outcome = self
            .transition(job, from, JobStatus::Failed, JobUpdate::failed(now, reason.clone()))
            .await?;
        if outcome.is_updated() {
            warn!(job_id = %job.job_id, owner_id = %job.owner_id, reason = %reason, "Export job failed");
        }
        Ok(AdvanceOutcome::from_update(from, JobStatus::Failed, outcome))
    }

    fn runner_parameters(&self, job: &ExportJob) -> RunnerParameters {
        RunnerParameters {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            request: job.request.clone(),
            output_bucket: self.config.results_bucket.clone(),
            output_prefix: Self::output_prefix(&job.job_id),
            worker_type: self.config.worker_type.clone(),
            worker_count: self.config.worker_count,
        }
    }
}
