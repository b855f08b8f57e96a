// Export Job Domain Model

use super::error::{DomainError, Result};
use super::manifest::Manifest;
use super::request::ExportRequest;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID (UUID v4)
pub type JobId = String;

/// Requester identity the job belongs to
pub type OwnerId = String;

/// Tenant identifier (multi-tenant deployments only)
pub type TenantId = String;

/// Opaque reference to an execution inside the job runner
pub type RunnerHandle = String;

/// Export job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Canceling,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceling,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceling => "CANCELING",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Legal transitions of the export state machine.
    ///
    /// `SUBMITTED -> SUBMITTED` and `CANCELING -> CANCELING` are bookkeeping
    /// writes (start retry scheduling, stop re-issue) and do not re-enter a state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Submitted, Submitted)
                | (Submitted, Running)
                | (Submitted, Canceled)
                | (Submitted, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceling)
                | (Canceling, Canceling)
                | (Canceling, Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::InvariantViolation(format!("unknown job status '{}'", s)))
    }
}

/// Export job entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    // Identity (immutable after creation)
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub tenant_id: Option<TenantId>,

    pub status: JobStatus,
    pub request: ExportRequest,

    pub submitted_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,

    // Execution
    pub runner_handle: Option<RunnerHandle>,
    pub output_locations: Vec<String>,
    pub manifest: Option<Manifest>,
    pub error_message: Option<String>,

    // Retention
    pub ttl_expires_at: i64,

    // Start retry bookkeeping (RunnerUnavailable)
    pub start_attempts: u32,
    pub next_start_at: Option<i64>,
}

impl ExportJob {
    /// Create a new job in `SUBMITTED`
    ///
    /// # Arguments
    /// * `job_id` - Unique id from the IdProvider
    /// * `owner_id` - Requester that owns the job
    /// * `tenant_id` - Requester tenant (None without multi-tenancy)
    /// * `request` - Validated export request
    /// * `now` - Submission instant (epoch ms)
    /// * `ttl_ms` - Retention period of the record and its results
    pub fn new(
        job_id: impl Into<JobId>,
        owner_id: impl Into<OwnerId>,
        tenant_id: Option<TenantId>,
        request: ExportRequest,
        now: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            tenant_id,
            status: JobStatus::Submitted,
            request,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            runner_handle: None,
            output_locations: Vec::new(),
            manifest: None,
            error_message: None,
            ttl_expires_at: now + ttl_ms,
            start_attempts: 0,
            next_start_at: None,
        }
    }

    /// Milliseconds elapsed since submission
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.submitted_at
    }

    /// True when a submitted job may attempt (or re-attempt) a runner start
    pub fn is_start_due(&self, now: i64) -> bool {
        self.status == JobStatus::Submitted && self.next_start_at.map_or(true, |at| at <= now)
    }

    /// Apply a conditional status change in memory.
    ///
    /// Used by the in-memory store; the SQLite store expresses the same rules in SQL.
    pub fn apply(&mut self, new_status: JobStatus, update: &JobUpdate) -> Result<()> {
        update.validate_for(self.status, new_status)?;

        self.status = new_status;
        self.updated_at = update.at;

        // Timestamps are set once and never rewound
        if self.started_at.is_none() {
            self.started_at = update.started_at;
        }
        if self.completed_at.is_none() {
            self.completed_at = update.completed_at;
        }
        if self.runner_handle.is_none() {
            self.runner_handle = update.runner_handle.clone();
        }

        if let Some(locations) = &update.output_locations {
            self.output_locations = locations.clone();
        }
        if let Some(manifest) = &update.manifest {
            self.manifest = Some(manifest.clone());
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(attempts) = update.start_attempts {
            self.start_attempts = attempts;
        }
        if let Some(next) = update.next_start_at {
            self.next_start_at = Some(next);
        }

        self.check_invariants()
    }

    /// Validate record-level invariants
    pub fn check_invariants(&self) -> Result<()> {
        let completed = self.status == JobStatus::Completed;
        if completed == self.output_locations.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "job {} is {} with {} output locations",
                self.job_id,
                self.status,
                self.output_locations.len()
            )));
        }

        let failed = self.status == JobStatus::Failed;
        if failed != self.error_message.is_some() {
            return Err(DomainError::InvariantViolation(format!(
                "job {} is {} but error_message presence is {}",
                self.job_id,
                self.status,
                self.error_message.is_some()
            )));
        }

        if self.status.is_terminal() && self.completed_at.is_none() {
            return Err(DomainError::InvariantViolation(format!(
                "terminal job {} has no completed_at",
                self.job_id
            )));
        }

        Ok(())
    }
}

/// Field changes written together with a status change
///
/// `at` is the write instant and becomes `updated_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub runner_handle: Option<RunnerHandle>,
    pub output_locations: Option<Vec<String>>,
    pub manifest: Option<Manifest>,
    pub error_message: Option<String>,
    pub start_attempts: Option<u32>,
    pub next_start_at: Option<i64>,
}

impl JobUpdate {
    /// Status-only write
    pub fn touch(at: i64) -> Self {
        Self {
            at,
            ..Default::default()
        }
    }

    /// Runner accepted the job
    pub fn started(at: i64, handle: impl Into<RunnerHandle>) -> Self {
        Self {
            at,
            started_at: Some(at),
            runner_handle: Some(handle.into()),
            ..Default::default()
        }
    }

    /// Runner succeeded and results were packaged
    pub fn completed(at: i64, output_locations: Vec<String>, manifest: Manifest) -> Self {
        Self {
            at,
            completed_at: Some(at),
            output_locations: Some(output_locations),
            manifest: Some(manifest),
            ..Default::default()
        }
    }

    pub fn failed(at: i64, reason: impl Into<String>) -> Self {
        Self {
            at,
            completed_at: Some(at),
            error_message: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn canceled(at: i64) -> Self {
        Self {
            at,
            completed_at: Some(at),
            ..Default::default()
        }
    }

    /// Runner was unavailable; try again at `next_start_at`
    pub fn start_deferred(at: i64, start_attempts: u32, next_start_at: i64) -> Self {
        Self {
            at,
            start_attempts: Some(start_attempts),
            next_start_at: Some(next_start_at),
            ..Default::default()
        }
    }

    /// Check that this update is a legal companion of `from -> to`
    pub fn validate_for(&self, from: JobStatus, to: JobStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(DomainError::InvalidStatusTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let has_outputs = self
            .output_locations
            .as_ref()
            .is_some_and(|locations| !locations.is_empty());
        if (to == JobStatus::Completed) != has_outputs {
            return Err(DomainError::InvariantViolation(format!(
                "{} -> {} requires output locations iff completing",
                from, to
            )));
        }
        if self.manifest.is_some() && to != JobStatus::Completed {
            return Err(DomainError::InvariantViolation(format!(
                "manifest written on {} -> {}",
                from, to
            )));
        }
        if (to == JobStatus::Failed) != self.error_message.is_some() {
            return Err(DomainError::InvariantViolation(format!(
                "{} -> {} requires error message iff failing",
                from, to
            )));
        }
        if to.is_terminal() && self.completed_at.is_none() {
            return Err(DomainError::InvariantViolation(format!(
                "{} -> {} requires completed_at",
                from, to
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::ManifestEntry;
    use crate::domain::request::ExportScope;

    fn submitted_job() -> ExportJob {
        ExportJob::new(
            "job-1",
            "owner-a",
            None,
            ExportRequest::new(ExportScope::System),
            1_000,
            10_000,
        )
    }

    fn manifest() -> Manifest {
        Manifest {
            entries: vec![ManifestEntry {
                url: "https://results/a".to_string(),
                content_type: "application/fhir+ndjson".to_string(),
                size_bytes: 10,
                resource_type: Some("Patient".to_string()),
            }],
            expires_at: 9_000,
            signed_by: "signer".to_string(),
        }
    }

    #[test]
    fn test_new_job_is_submitted() {
        let job = submitted_job();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.ttl_expires_at, 11_000);
        assert!(job.is_start_due(1_000));
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_no_reentry_into_left_states() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Submitted));
        assert!(!JobStatus::Canceling.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Canceling.can_transition_to(JobStatus::Canceled));
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_full_success_path() {
        let mut job = submitted_job();
        job.apply(JobStatus::Running, &JobUpdate::started(2_000, "run-1"))
            .unwrap();
        assert_eq!(job.started_at, Some(2_000));
        assert_eq!(job.runner_handle.as_deref(), Some("run-1"));

        job.apply(
            JobStatus::Completed,
            &JobUpdate::completed(3_000, vec!["bucket/job-1/Patient.ndjson".into()], manifest()),
        )
        .unwrap();
        assert_eq!(job.completed_at, Some(3_000));
        assert!(job.manifest.is_some());
    }

    #[test]
    fn test_completing_without_outputs_is_rejected() {
        let mut job = submitted_job();
        job.apply(JobStatus::Running, &JobUpdate::started(2_000, "run-1"))
            .unwrap();

        let mut update = JobUpdate::completed(3_000, vec![], manifest());
        update.manifest = None;
        let err = job.apply(JobStatus::Completed, &update).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn test_failure_requires_message() {
        let update = JobUpdate::canceled(2_000);
        assert!(update
            .validate_for(JobStatus::Running, JobStatus::Failed)
            .is_err());
        assert!(JobUpdate::failed(2_000, "boom")
            .validate_for(JobStatus::Running, JobStatus::Failed)
            .is_ok());
    }

    #[test]
    fn test_started_at_is_set_once() {
        let mut job = submitted_job();
        job.apply(
            JobStatus::Submitted,
            &JobUpdate::start_deferred(1_500, 1, 5_000),
        )
        .unwrap();
        assert_eq!(job.start_attempts, 1);
        assert!(!job.is_start_due(4_999));
        assert!(job.is_start_due(5_000));

        job.apply(JobStatus::Running, &JobUpdate::started(5_000, "run-1"))
            .unwrap();
        job.apply(JobStatus::Canceling, &JobUpdate::started(6_000, "run-2"))
            .unwrap();
        assert_eq!(job.started_at, Some(5_000));
        assert_eq!(job.runner_handle.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut job = submitted_job();
        let err = job
            .apply(JobStatus::Completed, &JobUpdate::touch(2_000))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidStatusTransition {
                from: "SUBMITTED".to_string(),
                to: "COMPLETED".to_string()
            }
        );
    }
}
