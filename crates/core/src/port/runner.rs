// Job Runner Port
// Opaque interface to the extraction compute engine

use crate::domain::{ExportRequest, JobId, RunnerHandle, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything the runner needs to execute one extraction
///
/// The runner never sees an `ExportJob`; it only gets these parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerParameters {
    pub job_id: JobId,
    pub tenant_id: Option<TenantId>,
    pub request: ExportRequest,
    /// Bucket the runner writes results into
    pub output_bucket: String,
    /// Key prefix inside the bucket (one per job)
    pub output_prefix: String,
    /// Compute worker size, e.g. `G.2X`
    pub worker_type: String,
    pub worker_count: u32,
}

/// Runner-reported execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerStatus {
    Running,
    /// Finished; ordered result locations (`bucket/key`)
    Succeeded(Vec<String>),
    Failed(String),
    /// Ended because a stop was requested
    Stopped,
}

impl RunnerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RunnerStatus::Running)
    }
}

/// Answer to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Stop accepted; the execution will wind down
    Acknowledged,
    /// Execution had already ended
    AlreadyTerminal,
}

/// Runner errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// Engine cannot accept work right now (capacity, throttling). Transient.
    #[error("Runner unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown runner handle: {0}")]
    UnknownHandle(String),

    #[error("Invalid runner parameters: {0}")]
    InvalidParameters(String),

    #[error("Runner failure: {0}")]
    Failure(String),
}

impl RunnerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Unavailable(_))
    }
}

/// Job runner trait
///
/// Implementations:
/// - SubprocessRunner: runs the extraction command as a child process
/// - ScriptedRunner: deterministic fake for tests
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Start an extraction
    ///
    /// Idempotent per `params.job_id`: once an execution was accepted for a
    /// job, later starts return its handle instead of starting another. A
    /// caller that timed out waiting can therefore retry safely.
    ///
    /// # Errors
    /// - RunnerError::Unavailable if the engine is at capacity
    /// - RunnerError::InvalidParameters if the parameters are rejected
    async fn start(&self, params: &RunnerParameters) -> Result<RunnerHandle, RunnerError>;

    /// Report execution status
    async fn poll(&self, handle: &str) -> Result<RunnerStatus, RunnerError>;

    /// Request the execution to stop (idempotent)
    async fn stop(&self, handle: &str) -> Result<StopOutcome, RunnerError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Runner driven by queued responses
    ///
    /// `start` returns the handle already accepted for the job, otherwise pops
    /// from the start script (default: a fresh handle), `poll`
    /// pops from the poll script and repeats the last response once the
    /// script is exhausted (default: Running).
    #[derive(Default)]
    pub struct ScriptedRunner {
        start_script: Mutex<VecDeque<Result<RunnerHandle, RunnerError>>>,
        poll_script: Mutex<VecDeque<Result<RunnerStatus, RunnerError>>>,
        last_poll: Mutex<Option<Result<RunnerStatus, RunnerError>>>,
        stop_response: Mutex<Option<Result<StopOutcome, RunnerError>>>,
        poll_barrier: Mutex<Option<Arc<Barrier>>>,
        poll_delay: Mutex<Option<Duration>>,
        start_delay: Mutex<Option<Duration>>,
        accepted: Mutex<HashMap<JobId, RunnerHandle>>,
        start_calls: AtomicUsize,
        poll_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        stopped_handles: Mutex<Vec<RunnerHandle>>,
        started_params: Mutex<Vec<RunnerParameters>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_start(&self, response: Result<RunnerHandle, RunnerError>) -> &Self {
            self.start_script.lock().unwrap().push_back(response);
            self
        }

        pub fn push_poll(&self, response: Result<RunnerStatus, RunnerError>) -> &Self {
            self.poll_script.lock().unwrap().push_back(response);
            self
        }

        pub fn set_stop_response(&self, response: Result<StopOutcome, RunnerError>) {
            *self.stop_response.lock().unwrap() = Some(response);
        }

        /// Make every poller wait at `barrier` before returning
        pub fn set_poll_barrier(&self, barrier: Arc<Barrier>) {
            *self.poll_barrier.lock().unwrap() = Some(barrier);
        }

        /// Make every poll sleep first (for timeout tests)
        pub fn set_poll_delay(&self, delay: Duration) {
            *self.poll_delay.lock().unwrap() = Some(delay);
        }

        /// Make every start accept the work, then sleep before answering
        pub fn set_start_delay(&self, delay: Option<Duration>) {
            *self.start_delay.lock().unwrap() = delay;
        }

        /// Distinct executions accepted so far
        pub fn accepted_executions(&self) -> usize {
            self.accepted.lock().unwrap().len()
        }

        pub fn start_calls(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub fn poll_calls(&self) -> usize {
            self.poll_calls.load(Ordering::SeqCst)
        }

        pub fn stop_calls(&self) -> usize {
            self.stop_calls.load(Ordering::SeqCst)
        }

        pub fn stopped_handles(&self) -> Vec<RunnerHandle> {
            self.stopped_handles.lock().unwrap().clone()
        }

        pub fn started_params(&self) -> Vec<RunnerParameters> {
            self.started_params.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn start(&self, params: &RunnerParameters) -> Result<RunnerHandle, RunnerError> {
            let call = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.started_params.lock().unwrap().push(params.clone());

            let response = {
                let mut accepted = self.accepted.lock().unwrap();
                match accepted.get(&params.job_id) {
                    Some(handle) => Ok(handle.clone()),
                    None => {
                        let scripted = self.start_script.lock().unwrap().pop_front();
                        let response = scripted
                            .unwrap_or_else(|| Ok(format!("run-{}-{}", params.job_id, call)));
                        if let Ok(handle) = &response {
                            accepted.insert(params.job_id.clone(), handle.clone());
                        }
                        response
                    }
                }
            };

            let delay = *self.start_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }

        async fn poll(&self, _handle: &str) -> Result<RunnerStatus, RunnerError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);

            let response = {
                let next = self.poll_script.lock().unwrap().pop_front();
                let mut last = self.last_poll.lock().unwrap();
                match next {
                    Some(response) => {
                        *last = Some(response.clone());
                        response
                    }
                    None => last.clone().unwrap_or(Ok(RunnerStatus::Running)),
                }
            };

            let delay = *self.poll_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let barrier = self.poll_barrier.lock().unwrap().clone();
            if let Some(barrier) = barrier {
                barrier.wait().await;
            }

            response
        }

        async fn stop(&self, handle: &str) -> Result<StopOutcome, RunnerError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped_handles.lock().unwrap().push(handle.to_string());
            self.stop_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Ok(StopOutcome::Acknowledged))
        }
    }
}
