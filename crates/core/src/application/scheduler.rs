//! Advance scheduler - periodic trigger for `advance_all`
//!
//! Polling is the only notification path from the runner, so this loop is
//! what moves RUNNING and CANCELING jobs to their terminal states and what
//! retries deferred starts.

use super::orchestrator::{AdvanceReport, ExportOrchestrator};
use super::shutdown::ShutdownToken;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct AdvanceScheduler {
    orchestrator: Arc<ExportOrchestrator>,
    poll_interval: Duration,
}

impl AdvanceScheduler {
    pub fn new(orchestrator: Arc<ExportOrchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            poll_interval,
        }
    }

    /// Run one pass immediately (manual trigger)
    pub async fn run_once(&self) -> Result<AdvanceReport> {
        self.orchestrator.advance_all().await
    }

    /// Run the scheduled loop until shutdown
    ///
    /// A pass in progress is finished before the loop exits. Passes never
    /// overlap; a slow pass delays the next tick instead of stacking.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = self.poll_interval.as_secs_f64(),
            "Advance scheduler started"
        );

        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.wait() => {
                    info!("Advance scheduler shutting down");
                    break;
                }
            }

            if let Err(e) = self.orchestrator.advance_all().await {
                error!(error = %e, "Scheduled advance pass failed");
            }

            if shutdown.is_shutdown() {
                info!("Advance scheduler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::OrchestratorConfig;
    use crate::application::packager::ResultPackager;
    use crate::application::shutdown::shutdown_channel;
    use crate::domain::{ExportRequest, JobStatus, RequesterIdentity, NDJSON_CONTENT_TYPE};
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::object_store::mocks::InMemoryObjectStore;
    use crate::port::runner::mocks::ScriptedRunner;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::url_signer::mocks::StaticUrlSigner;
    use crate::port::{JobStore, RunnerStatus};

    #[tokio::test]
    async fn test_scheduled_loop_completes_running_job_and_stops() {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let packager = Arc::new(ResultPackager::new(
            objects.clone(),
            Arc::new(StaticUrlSigner::new("results")),
            clock.clone(),
            60_000,
        ));
        let config = OrchestratorConfig {
            results_bucket: "results".to_string(),
            ..Default::default()
        };
        let orchestrator = Arc::new(
            ExportOrchestrator::new(
                config,
                store.clone(),
                runner.clone(),
                packager,
                Arc::new(SequentialIdProvider::new("job")),
                clock,
            )
            .unwrap(),
        );

        let job_id = orchestrator
            .start_export(
                &RequesterIdentity::new("alice"),
                ExportRequest::new("Patient".parse().unwrap()),
            )
            .await
            .unwrap();
        objects.insert("results/job-1/Patient.ndjson", 42, NDJSON_CONTENT_TYPE);
        runner.push_poll(Ok(RunnerStatus::Succeeded(vec![
            "results/job-1/Patient.ndjson".to_string(),
        ])));

        let (sender, token) = shutdown_channel();
        let scheduler = AdvanceScheduler::new(orchestrator, Duration::from_millis(10));
        let handle = tokio::spawn(scheduler.run(token));

        let mut completed = false;
        for _ in 0..100 {
            if store.get(&job_id).await.unwrap().unwrap().status == JobStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);

        sender.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
