// Subprocess runner: the extraction engine as a local child process
// reason: tokio::process for non-blocking child management, nix for signals
//
// Child contract:
// - receives EXPORT_* variables (job id, output dir, parameters as JSON)
// - writes one NDJSON file per resource type into EXPORT_OUTPUT_DIR
// - exit 0 means success; anything else is a failure, stderr is kept in a log
//
// Execution state lives in `log_dir`, not in memory, so any process sharing
// the directory can poll or stop an execution another process started:
// - `<handle>.log`  stderr of the child, created first (claims the handle)
// - `<handle>.json` pid, output location and stop request
// - `<handle>.exit` exit code, written by the wrapper shell when the child ends
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fhir_export_core::application::constants::SUPPORTED_WORKER_TYPES;
use fhir_export_core::domain::RunnerHandle;
use fhir_export_core::port::{
    JobRunner, RunnerError, RunnerParameters, RunnerStatus, StopOutcome, SystemProbe,
};

/// Finished executions are remembered this long so late polls still answer
const FINISHED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How much of the stderr log tail becomes the failure reason
const FAILURE_REASON_MAX_CHARS: usize = 500;

const HANDLE_PREFIX: &str = "run-";

/// Shell that runs the extraction and records its exit code
const WRAPPER_SHELL: &str = "/bin/sh";
const WRAPPER_NAME: &str = "fhir-export-run";
const WRAPPER_SCRIPT: &str =
    r#"exit_file="$1"; shift; "$@"; code=$?; printf '%s\n' "$code" > "$exit_file"; exit "$code""#;

#[derive(Debug, Clone)]
pub struct SubprocessRunnerConfig {
    /// Extraction program
    pub command: String,
    pub args: Vec<String>,
    /// Parent environment variables passed through to the child
    pub env_allowlist: Vec<String>,
    /// Root of the result object store; outputs go to `<root>/<bucket>/<prefix>`
    pub results_root: PathBuf,
    /// Execution state and stderr logs, shared by every process driving exports
    pub log_dir: PathBuf,
    pub max_concurrent_runs: usize,
    /// Refuse new executions above this CPU usage
    pub cpu_throttle_percent: f32,
    /// Refuse new executions below this much free memory
    pub min_free_memory_mb: u64,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace_period: Duration,
}

/// Persisted view of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecutionRecord {
    job_id: String,
    /// Wrapper shell pid, also its process group id
    pid: u32,
    output_dir: PathBuf,
    output_bucket: String,
    output_prefix: String,
    started_at_ms: i64,
    stop_requested_at_ms: Option<i64>,
}

struct ExecutionFiles {
    log: PathBuf,
    record: PathBuf,
    exit: PathBuf,
}

/// Local extraction engine
///
/// Reports `Unavailable` at `max_concurrent_runs` or when the host CPU is
/// above `cpu_throttle_percent`; the orchestrator retries those starts later.
/// The handle is derived from the job id, so a repeated start for the same
/// job returns the execution already running instead of spawning another.
pub struct SubprocessRunner {
    config: SubprocessRunnerConfig,
    system_probe: Arc<dyn SystemProbe>,
    /// Held from the capacity check until the execution is recorded
    start_gate: Mutex<()>,
}

impl SubprocessRunner {
    pub fn new(config: SubprocessRunnerConfig, system_probe: Arc<dyn SystemProbe>) -> Self {
        Self {
            config,
            system_probe,
            start_gate: Mutex::new(()),
        }
    }

    fn handle_for(job_id: &str) -> RunnerHandle {
        format!("{}{}", HANDLE_PREFIX, job_id)
    }

    fn is_safe_component(value: &str) -> bool {
        !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn files(&self, handle: &str) -> Result<ExecutionFiles, RunnerError> {
        let valid = handle
            .strip_prefix(HANDLE_PREFIX)
            .is_some_and(Self::is_safe_component);
        if !valid {
            return Err(RunnerError::UnknownHandle(handle.to_string()));
        }
        Ok(ExecutionFiles {
            log: self.config.log_dir.join(format!("{}.log", handle)),
            record: self.config.log_dir.join(format!("{}.json", handle)),
            exit: self.config.log_dir.join(format!("{}.exit", handle)),
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Number of executions still running, whichever process started them
    pub async fn active_runs(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.config.log_dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut active = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(handle) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(files) = self.files(handle) else {
                continue;
            };
            if Self::read_exit_code(&files).await.is_some() {
                continue;
            }
            if let Ok(Some(record)) = Self::read_record(&files).await {
                if Self::is_alive(record.pid) {
                    active += 1;
                }
            }
        }
        active
    }

    fn validate(params: &RunnerParameters) -> Result<(), RunnerError> {
        if !SUPPORTED_WORKER_TYPES.contains(&params.worker_type.as_str()) {
            return Err(RunnerError::InvalidParameters(format!(
                "unsupported worker type '{}' (expected one of {:?})",
                params.worker_type, SUPPORTED_WORKER_TYPES
            )));
        }
        if params.worker_count == 0 {
            return Err(RunnerError::InvalidParameters(
                "worker count must be positive".to_string(),
            ));
        }
        if !Self::is_safe_component(&params.job_id) {
            return Err(RunnerError::InvalidParameters(format!(
                "job id '{}' cannot name an execution",
                params.job_id
            )));
        }
        if params.output_bucket.is_empty()
            || params.output_prefix.contains("..")
            || params.output_prefix.starts_with('/')
        {
            return Err(RunnerError::InvalidParameters(format!(
                "invalid output location '{}/{}'",
                params.output_bucket, params.output_prefix
            )));
        }
        Ok(())
    }

    /// Pass-through of allowlisted parent variables
    fn filter_env(&self, env: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
        env.filter(|(k, _)| self.config.env_allowlist.contains(k))
            .collect()
    }

    fn export_env(
        params: &RunnerParameters,
        output_dir: &Path,
    ) -> Result<HashMap<String, String>, RunnerError> {
        let parameters = serde_json::to_string(params)
            .map_err(|e| RunnerError::InvalidParameters(e.to_string()))?;

        let mut env = HashMap::new();
        env.insert("EXPORT_JOB_ID".to_string(), params.job_id.clone());
        env.insert(
            "EXPORT_OUTPUT_DIR".to_string(),
            output_dir.display().to_string(),
        );
        env.insert("EXPORT_OUTPUT_BUCKET".to_string(), params.output_bucket.clone());
        env.insert("EXPORT_OUTPUT_PREFIX".to_string(), params.output_prefix.clone());
        env.insert("EXPORT_SCOPE".to_string(), params.request.scope.to_string());
        env.insert(
            "EXPORT_RESOURCE_TYPES".to_string(),
            params.request.resource_types.join(","),
        );
        env.insert("EXPORT_WORKER_TYPE".to_string(), params.worker_type.clone());
        env.insert(
            "EXPORT_WORKER_COUNT".to_string(),
            params.worker_count.to_string(),
        );
        env.insert("EXPORT_PARAMETERS".to_string(), parameters);
        if let Some(tenant_id) = &params.tenant_id {
            env.insert("EXPORT_TENANT_ID".to_string(), tenant_id.clone());
        }
        Ok(env)
    }

    async fn check_capacity(&self) -> Result<(), RunnerError> {
        let active = self.active_runs().await;
        if active >= self.config.max_concurrent_runs {
            return Err(RunnerError::Unavailable(format!(
                "{} of {} extraction slots in use",
                active, self.config.max_concurrent_runs
            )));
        }

        let load = self.system_probe.host_load().await;
        match load.saturation(self.config.cpu_throttle_percent, self.config.min_free_memory_mb) {
            Some(reason) => Err(RunnerError::Unavailable(reason)),
            None => Ok(()),
        }
    }

    /// Forget executions that ended more than `FINISHED_RETENTION` ago
    async fn prune_finished(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.log_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(handle) = name.strip_suffix(".exit") else {
                continue;
            };
            let expired = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= FINISHED_RETENTION);
            if !expired {
                continue;
            }
            if let Ok(files) = self.files(handle) {
                debug!(handle = %handle, "Pruning finished execution");
                for path in [&files.record, &files.log, &files.exit] {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
        }
    }

    async fn read_record(files: &ExecutionFiles) -> Result<Option<ExecutionRecord>, RunnerError> {
        let raw = match tokio::fs::read(&files.record).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RunnerError::Failure(format!(
                    "cannot read execution record: {}",
                    e
                )))
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| RunnerError::Failure(format!("corrupt execution record: {}", e)))
    }

    /// Replace the record atomically so readers never see a partial file
    async fn write_record(files: &ExecutionFiles, record: &ExecutionRecord) -> Result<(), RunnerError> {
        let raw = serde_json::to_vec(record)
            .map_err(|e| RunnerError::Failure(format!("cannot encode execution record: {}", e)))?;
        let staging = files.record.with_extension("json.tmp");
        tokio::fs::write(&staging, raw)
            .await
            .map_err(|e| RunnerError::Failure(format!("cannot write execution record: {}", e)))?;
        tokio::fs::rename(&staging, &files.record)
            .await
            .map_err(|e| RunnerError::Failure(format!("cannot write execution record: {}", e)))
    }

    /// Exit code recorded by the wrapper; `None` while absent or half-written
    async fn read_exit_code(files: &ExecutionFiles) -> Option<i32> {
        tokio::fs::read_to_string(&files.exit)
            .await
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    async fn is_claimed(files: &ExecutionFiles) -> bool {
        tokio::fs::try_exists(&files.log).await.unwrap_or(false)
    }

    /// Sorted `bucket/key` locations of the files the child wrote
    async fn collect_outputs(
        output_dir: &Path,
        bucket: &str,
        prefix: &str,
    ) -> std::io::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut locations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                locations.push(format!(
                    "{}/{}{}",
                    bucket,
                    prefix,
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        locations.sort();
        Ok(locations)
    }

    async fn failure_reason(log_path: &Path, how: &str) -> String {
        let tail = tokio::fs::read_to_string(log_path)
            .await
            .ok()
            .and_then(|log| {
                log.lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .map(|line| line.trim().chars().take(FAILURE_REASON_MAX_CHARS).collect::<String>())
            });

        match tail {
            Some(tail) => format!("extraction {}: {}", how, tail),
            None => format!("extraction {}", how),
        }
    }

    /// Terminal status of an execution that is no longer running
    async fn finished_status(
        files: &ExecutionFiles,
        record: &ExecutionRecord,
        exit_code: Option<i32>,
    ) -> RunnerStatus {
        if record.stop_requested_at_ms.is_some() {
            return RunnerStatus::Stopped;
        }
        match exit_code {
            Some(0) => {}
            Some(code) => {
                let how = format!("exited with code {}", code);
                return RunnerStatus::Failed(Self::failure_reason(&files.log, &how).await);
            }
            None => {
                return RunnerStatus::Failed(
                    Self::failure_reason(&files.log, "ended without reporting an exit code").await,
                )
            }
        }
        match Self::collect_outputs(&record.output_dir, &record.output_bucket, &record.output_prefix)
            .await
        {
            Ok(locations) => RunnerStatus::Succeeded(locations),
            Err(e) => RunnerStatus::Failed(format!("could not list extraction output: {}", e)),
        }
    }

    #[cfg(unix)]
    fn is_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) => !matches!(kill(Pid::from_raw(raw), None), Err(nix::errno::Errno::ESRCH)),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(_pid: u32) -> bool {
        // Without signals only the exit file tells an execution has ended
        true
    }

    /// Signal the whole process group of the wrapper
    #[cfg(unix)]
    fn signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), RunnerError> {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| RunnerError::Failure(format!("pid {} out of range", pid)))?;
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(RunnerError::Failure(format!("{:?} failed: {}", signal, e))),
        }
    }

    /// SIGTERM now, SIGKILL after the grace period if still running
    #[cfg(unix)]
    fn terminate(&self, handle: &str, pid: u32) -> Result<(), RunnerError> {
        use nix::sys::signal::Signal;

        info!(handle = %handle, pid = pid, "Sending SIGTERM to extraction");
        Self::signal(pid, Signal::SIGTERM)?;

        // Later polls and stops escalate too, if this process is gone by then
        let grace = self.config.stop_grace_period;
        let handle = handle.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = Self::signal(pid, Signal::SIGKILL) {
                warn!(handle = %handle, pid = pid, error = %e, "SIGKILL failed");
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self, handle: &str, _pid: u32) -> Result<(), RunnerError> {
        Err(RunnerError::Failure(format!(
            "cannot signal extraction {} on this platform",
            handle
        )))
    }

    /// SIGKILL a stopped execution that outlived its grace period
    fn escalate(&self, handle: &str, record: &ExecutionRecord) {
        let Some(requested_at) = record.stop_requested_at_ms else {
            return;
        };
        let grace_ms = i64::try_from(self.config.stop_grace_period.as_millis()).unwrap_or(i64::MAX);
        if Self::now_ms().saturating_sub(requested_at) < grace_ms {
            return;
        }

        #[cfg(unix)]
        {
            warn!(handle = %handle, pid = record.pid, "Extraction ignored SIGTERM, sending SIGKILL");
            if let Err(e) = Self::signal(record.pid, nix::sys::signal::Signal::SIGKILL) {
                warn!(handle = %handle, pid = record.pid, error = %e, "SIGKILL failed");
            }
        }
        #[cfg(not(unix))]
        let _ = handle;
    }

    fn wrapper_command(&self, exit_file: &Path) -> Command {
        let mut command = std::process::Command::new(WRAPPER_SHELL);
        command
            .arg("-c")
            .arg(WRAPPER_SCRIPT)
            .arg(WRAPPER_NAME)
            .arg(exit_file)
            .arg(&self.config.command)
            .args(&self.config.args);

        // Own process group, so stop reaches the extraction and its children
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Command::from(command)
    }

    async fn spawn(
        &self,
        params: &RunnerParameters,
        handle: &str,
        files: &ExecutionFiles,
        output_dir: PathBuf,
    ) -> Result<(), RunnerError> {
        let log_file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&files.log)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(job_id = %params.job_id, handle = %handle, "Execution claimed by another process");
                return Ok(());
            }
            Err(e) => {
                return Err(RunnerError::Failure(format!(
                    "cannot create log file: {}",
                    e
                )))
            }
        };

        let spawned = self
            .wrapper_command(&files.exit)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .envs(Self::export_env(params, &output_dir)?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&files.log).await;
                return Err(RunnerError::Failure(format!(
                    "cannot spawn '{}': {}",
                    self.config.command, e
                )));
            }
        };

        let Some(pid) = child.id() else {
            let _ = tokio::fs::remove_file(&files.log).await;
            return Err(RunnerError::Failure(format!(
                "extraction {} exited before it could be recorded",
                handle
            )));
        };

        let record = ExecutionRecord {
            job_id: params.job_id.clone(),
            pid,
            output_dir,
            output_bucket: params.output_bucket.clone(),
            output_prefix: params.output_prefix.clone(),
            started_at_ms: Self::now_ms(),
            stop_requested_at_ms: None,
        };
        if let Err(e) = Self::write_record(files, &record).await {
            let _ = child.start_kill();
            let _ = tokio::fs::remove_file(&files.log).await;
            return Err(e);
        }

        // Reap the wrapper so a finished execution never looks alive
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        info!(
            job_id = %params.job_id,
            handle = %handle,
            pid = pid,
            worker_type = %params.worker_type,
            worker_count = params.worker_count,
            "Extraction started"
        );
        Ok(())
    }
}

#[async_trait]
impl JobRunner for SubprocessRunner {
    async fn start(&self, params: &RunnerParameters) -> Result<RunnerHandle, RunnerError> {
        Self::validate(params)?;
        let handle = Self::handle_for(&params.job_id);
        let files = self.files(&handle)?;

        let _gate = self.start_gate.lock().await;
        if Self::is_claimed(&files).await {
            debug!(job_id = %params.job_id, handle = %handle, "Extraction already started");
            return Ok(handle);
        }

        self.prune_finished().await;
        self.check_capacity().await?;

        let output_dir = self
            .config
            .results_root
            .join(&params.output_bucket)
            .join(&params.output_prefix);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| RunnerError::Failure(format!("cannot create output dir: {}", e)))?;
        tokio::fs::create_dir_all(&self.config.log_dir)
            .await
            .map_err(|e| RunnerError::Failure(format!("cannot create log dir: {}", e)))?;

        self.spawn(params, &handle, &files, output_dir).await?;
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> Result<RunnerStatus, RunnerError> {
        let files = self.files(handle)?;
        let record = match Self::read_record(&files).await? {
            Some(record) => record,
            // Claimed, record not written yet
            None if Self::is_claimed(&files).await => return Ok(RunnerStatus::Running),
            None => return Err(RunnerError::UnknownHandle(handle.to_string())),
        };

        let exit_code = match Self::read_exit_code(&files).await {
            Some(code) => Some(code),
            None if Self::is_alive(record.pid) => {
                self.escalate(handle, &record);
                return Ok(RunnerStatus::Running);
            }
            // The wrapper may have written the code just before exiting
            None => Self::read_exit_code(&files).await,
        };

        let status = Self::finished_status(&files, &record, exit_code).await;
        debug!(
            job_id = %record.job_id,
            handle = %handle,
            status = ?status,
            elapsed_ms = Self::now_ms().saturating_sub(record.started_at_ms),
            "Extraction finished"
        );
        Ok(status)
    }

    async fn stop(&self, handle: &str) -> Result<StopOutcome, RunnerError> {
        let files = self.files(handle)?;
        let mut record = match Self::read_record(&files).await? {
            Some(record) => record,
            None if Self::is_claimed(&files).await => {
                return Err(RunnerError::Unavailable(format!(
                    "extraction {} is still starting",
                    handle
                )))
            }
            None => return Err(RunnerError::UnknownHandle(handle.to_string())),
        };

        if Self::read_exit_code(&files).await.is_some() || !Self::is_alive(record.pid) {
            return Ok(StopOutcome::AlreadyTerminal);
        }
        if record.stop_requested_at_ms.is_some() {
            // SIGTERM already sent
            self.escalate(handle, &record);
            return Ok(StopOutcome::Acknowledged);
        }

        record.stop_requested_at_ms = Some(Self::now_ms());
        Self::write_record(&files, &record).await?;
        self.terminate(handle, record.pid)?;
        Ok(StopOutcome::Acknowledged)
    }
}
