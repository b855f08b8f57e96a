// Runner start retry logic
use super::config::OrchestratorConfig;
use crate::domain::ExportJob;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the start again after this many ms
    Retry(i64),
    /// Attempts exhausted; the job fails
    GiveUp,
}

/// Bounded exponential backoff for `RunnerUnavailable` at start
///
/// delay = base_delay * (backoff_factor ^ (attempts - 1)) * jitter
pub struct StartRetryPolicy {
    max_attempts: u32,
    base_delay_ms: i64,
    backoff_factor: f64,
}

impl StartRetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `max_attempts` - Total start attempts allowed, including the first
    /// * `base_delay_ms` - Delay after the first failed attempt
    /// * `backoff_factor` - Multiplier per further attempt
    pub fn new(max_attempts: u32, base_delay_ms: i64, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_factor,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.max_start_attempts,
            config.start_backoff_base_ms,
            config.start_backoff_factor,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after `attempts` failed start attempts
    ///
    /// # Example
    /// ```text
    /// match policy.decide(&job.job_id, job.start_attempts + 1) {
    ///     RetryDecision::Retry(delay_ms) => schedule(now + delay_ms),
    ///     RetryDecision::GiveUp => fail(job),
    /// }
    /// ```
    pub fn decide(&self, job_id: &str, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts {
            warn!(
                job_id = %job_id,
                attempts = attempts,
                max_attempts = self.max_attempts,
                "Runner start attempts exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay_ms = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);

        // ±10% jitter seeded by the job id, so retries of many jobs spread out
        // while each job's schedule stays deterministic
        let jitter_seed = job_id.chars().map(|c| c as u32).fold(0u32, u32::wrapping_add);
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0);

        let delay_ms = (base_delay_ms * jitter_factor) as i64;

        info!(
            job_id = %job_id,
            attempt = attempts,
            max_attempts = self.max_attempts,
            delay_ms = delay_ms,
            "Scheduling runner start retry"
        );

        RetryDecision::Retry(delay_ms)
    }
}

/// True when the job has outlived the absolute age ceiling
pub fn is_age_exceeded(job: &ExportJob, now: i64, max_job_age_ms: i64) -> bool {
    let age_ms = job.age_ms(now);
    if age_ms > max_job_age_ms {
        warn!(
            job_id = %job.job_id,
            status = %job.status,
            age_ms = age_ms,
            max_job_age_ms = max_job_age_ms,
            "Export job exceeded maximum age"
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExportRequest, ExportScope};

    #[test]
    fn test_retry_until_exhausted() {
        let policy = StartRetryPolicy::new(3, 1_000, 2.0);

        assert!(matches!(policy.decide("job", 1), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide("job", 2), RetryDecision::Retry(_)));
        assert_eq!(policy.decide("job", 3), RetryDecision::GiveUp);
        assert_eq!(policy.decide("job", 4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_grows_within_jitter_bounds() {
        let policy = StartRetryPolicy::new(10, 1_000, 2.0);

        let RetryDecision::Retry(first) = policy.decide("job-x", 1) else {
            panic!("expected retry");
        };
        let RetryDecision::Retry(third) = policy.decide("job-x", 3) else {
            panic!("expected retry");
        };

        assert!((900..=1_100).contains(&first), "first delay {}", first);
        assert!((3_600..=4_400).contains(&third), "third delay {}", third);
        assert!(third > first * 3);
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let policy = StartRetryPolicy::new(1, 1_000, 2.0);
        assert_eq!(policy.decide("job", 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_age_ceiling() {
        let job = ExportJob::new(
            "job-1",
            "owner",
            None,
            ExportRequest::new(ExportScope::System),
            1_000,
            100_000,
        );
        assert!(!is_age_exceeded(&job, 6_000, 5_000));
        assert!(is_age_exceeded(&job, 6_001, 5_000));
    }
}
