// Retention Sweeper
// Reclaims terminal export jobs after their TTL, outputs first, record last

use super::orchestrator::ExportOrchestrator;
use super::shutdown::ShutdownToken;
use crate::error::Result;
use crate::port::{Maintenance, ObjectStore, RetentionConfig, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records deleted
    pub reclaimed: usize,
    /// Result objects deleted across all reclaimed jobs
    pub objects_deleted: usize,
    /// Jobs left for the next pass
    pub skipped: usize,
}

/// Retention sweeper
///
/// Deletes a job's result objects before its record, so a record only
/// disappears once nothing it points at is left behind. A failed object
/// delete leaves the record for the next pass.
pub struct RetentionSweeper {
    maintenance: Arc<dyn Maintenance>,
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
    results_bucket: String,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        object_store: Arc<dyn ObjectStore>,
        time_provider: Arc<dyn TimeProvider>,
        results_bucket: impl Into<String>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            maintenance,
            object_store,
            time_provider,
            results_bucket: results_bucket.into(),
            config,
        }
    }

    /// Run one sweep pass immediately (manual trigger)
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = self.time_provider.now_millis();
        let expired = self
            .maintenance
            .find_expired(now, self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for job in expired {
            let prefix = ExportOrchestrator::output_prefix(&job.job_id);
            let deleted = match self
                .object_store
                .delete_prefix(&self.results_bucket, &prefix)
                .await
            {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Could not delete export results, keeping record");
                    report.skipped += 1;
                    continue;
                }
            };

            if self.maintenance.delete_expired(&job.job_id, now).await? {
                debug!(job_id = %job.job_id, objects = deleted, "Expired export job reclaimed");
                report.reclaimed += 1;
                report.objects_deleted += deleted;
            } else {
                report.skipped += 1;
            }
        }

        if report.reclaimed > 0 || report.skipped > 0 {
            info!(
                reclaimed = report.reclaimed,
                objects_deleted = report.objects_deleted,
                skipped = report.skipped,
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    /// Run the sweep loop until shutdown (spawn with tokio::spawn)
    pub async fn run(self, sweep_interval: Duration, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = sweep_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Retention sweeper started"
        );

        let mut tick = interval(sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.wait() => {
                    info!("Retention sweeper shutting down");
                    break;
                }
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "Retention sweep failed");
            }
        }
    }
}
