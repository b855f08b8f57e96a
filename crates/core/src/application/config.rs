// Orchestrator configuration

use super::constants::*;
use crate::error::{ExportError, Result};
use std::time::Duration;

/// Tunables of the export state machine
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_start_attempts: u32,
    pub start_backoff_base_ms: i64,
    pub start_backoff_factor: f64,
    pub max_job_age_ms: i64,
    pub job_ttl_ms: i64,
    pub call_timeout: Duration,
    pub advance_concurrency: usize,
    pub enable_multi_tenancy: bool,
    pub results_bucket: String,
    pub worker_type: String,
    pub worker_count: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_start_attempts: DEFAULT_MAX_START_ATTEMPTS,
            start_backoff_base_ms: DEFAULT_START_BACKOFF_BASE_MS,
            start_backoff_factor: DEFAULT_START_BACKOFF_FACTOR,
            max_job_age_ms: DEFAULT_MAX_JOB_AGE_MS,
            job_ttl_ms: DEFAULT_JOB_TTL_MS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            advance_concurrency: DEFAULT_ADVANCE_CONCURRENCY,
            enable_multi_tenancy: false,
            results_bucket: DEFAULT_RESULTS_BUCKET.to_string(),
            worker_type: DEFAULT_WORKER_TYPE.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

impl OrchestratorConfig {
    /// Reject configurations the state machine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_start_attempts == 0 {
            return Err(ExportError::Config(
                "max_start_attempts must be at least 1".to_string(),
            ));
        }
        if self.start_backoff_base_ms <= 0 || self.start_backoff_factor < 1.0 {
            return Err(ExportError::Config(
                "start backoff needs a positive base and a factor >= 1.0".to_string(),
            ));
        }
        if self.max_job_age_ms <= 0 {
            return Err(ExportError::Config(
                "max_job_age must be positive".to_string(),
            ));
        }
        // Records of running jobs must outlive the age ceiling
        if self.job_ttl_ms <= self.max_job_age_ms {
            return Err(ExportError::Config(format!(
                "job_ttl ({}ms) must exceed max_job_age ({}ms)",
                self.job_ttl_ms, self.max_job_age_ms
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(ExportError::Config(
                "call_timeout must be positive".to_string(),
            ));
        }
        if self.advance_concurrency == 0 {
            return Err(ExportError::Config(
                "advance_concurrency must be at least 1".to_string(),
            ));
        }
        if self.results_bucket.is_empty() || self.results_bucket.contains('/') {
            return Err(ExportError::Config(format!(
                "invalid results bucket '{}'",
                self.results_bucket
            )));
        }
        if !SUPPORTED_WORKER_TYPES.contains(&self.worker_type.as_str()) {
            return Err(ExportError::Config(format!(
                "worker_type must be one of {:?}, got '{}'",
                SUPPORTED_WORKER_TYPES, self.worker_type
            )));
        }
        if self.worker_count == 0 {
            return Err(ExportError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
