// Daemon configuration: defaults < TOML file < FHIR_EXPORT__* environment

use config::{Config, Environment, File};
use fhir_export_core::application::constants::*;
use fhir_export_core::application::OrchestratorConfig;
use fhir_export_core::error::{ExportError, Result};
use fhir_export_core::port::{RetentionConfig, SigningIdentity};
use fhir_export_infra_system::SubprocessRunnerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FHIR_EXPORT";
const DEFAULT_DB_PATH: &str = "~/.fhir-export/export-jobs.db";
const DEFAULT_RESULTS_DIR: &str = "~/.fhir-export/results";
const DEFAULT_RUNNER_LOG_DIR: &str = "~/.fhir-export/runs";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorSettings,
    pub tenancy: TenancyConfig,
    pub runner: RunnerSettings,
    pub results: ResultsConfig,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `sqlite:` URL or a plain path (tilde expanded)
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DB_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_secs: u64,
    pub max_start_attempts: u32,
    pub start_backoff_base_ms: i64,
    pub start_backoff_factor: f64,
    pub max_job_age_secs: i64,
    pub call_timeout_secs: u64,
    pub advance_concurrency: usize,
    pub job_ttl_secs: i64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            max_start_attempts: DEFAULT_MAX_START_ATTEMPTS,
            start_backoff_base_ms: DEFAULT_START_BACKOFF_BASE_MS,
            start_backoff_factor: DEFAULT_START_BACKOFF_FACTOR,
            max_job_age_secs: DEFAULT_MAX_JOB_AGE_MS / 1000,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            advance_concurrency: DEFAULT_ADVANCE_CONCURRENCY,
            job_ttl_secs: DEFAULT_JOB_TTL_MS / 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    pub enable_multi_tenancy: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env_allowlist: Vec<String>,
    pub log_dir: String,
    pub max_concurrent_runs: usize,
    pub cpu_throttle_percent: f32,
    pub min_free_memory_mb: u64,
    pub stop_grace_secs: u64,
    pub worker_type: String,
    pub worker_count: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command: "fhir-extract".to_string(),
            args: Vec::new(),
            env_allowlist: vec!["PATH".to_string(), "HOME".to_string(), "USER".to_string()],
            log_dir: DEFAULT_RUNNER_LOG_DIR.to_string(),
            max_concurrent_runs: 4,
            cpu_throttle_percent: 90.0,
            min_free_memory_mb: 512,
            stop_grace_secs: 10,
            worker_type: DEFAULT_WORKER_TYPE.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub root_dir: String,
    pub bucket: String,
    pub base_url: String,
    pub signer_role: String,
    pub signer_key_id: String,
    /// Set through `FHIR_EXPORT__RESULTS__SIGNING_SECRET`
    pub signing_secret: String,
    pub url_ttl_secs: i64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            root_dir: DEFAULT_RESULTS_DIR.to_string(),
            bucket: DEFAULT_RESULTS_BUCKET.to_string(),
            base_url: "http://localhost:8080/export-results".to_string(),
            signer_role: "export-results-signer".to_string(),
            signer_key_id: "default".to_string(),
            signing_secret: String::new(),
            url_ttl_secs: DEFAULT_URL_TTL_MS / 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub sweep_interval_secs: u64,
    pub batch_size: i64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            batch_size: RetentionConfig::default().batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Also write JSON logs to a daily rolling file in this directory
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            directory: None,
        }
    }
}

/// Default config file location (`<config dir>/fhir-export/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "fhir-export", "fhir-export")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl AppConfig {
    /// Load and validate the configuration
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ExportError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                builder = builder.add_source(File::from(path.to_path_buf()));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(File::from(default_path).required(false));
                }
            }
        }

        // e.g. FHIR_EXPORT__ORCHESTRATOR__MAX_JOB_AGE_SECS=3600
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );

        let merged: AppConfig = builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| ExportError::Config(e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        self.orchestrator_config().validate()?;

        if self.orchestrator.poll_interval_secs == 0 {
            return Err(ExportError::Config(
                "orchestrator.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.maintenance.sweep_interval_secs == 0 || self.maintenance.batch_size <= 0 {
            return Err(ExportError::Config(
                "maintenance needs a positive sweep interval and batch size".to_string(),
            ));
        }
        if self.results.url_ttl_secs <= 0 {
            return Err(ExportError::Config(
                "results.url_ttl_secs must be positive".to_string(),
            ));
        }
        if self.runner.command.trim().is_empty() {
            return Err(ExportError::Config("runner.command is empty".to_string()));
        }
        if self.runner.max_concurrent_runs == 0 {
            return Err(ExportError::Config(
                "runner.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// SQLite URL with the path tilde-expanded
    pub fn database_url(&self) -> String {
        let url = self.database.url.trim();
        if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", expand(url).display())
        }
    }

    /// Parent directory of a file database, if any
    pub fn database_dir(&self) -> Option<PathBuf> {
        let url = self.database.url.trim();
        if url.starts_with("sqlite:") {
            return None;
        }
        expand(url).parent().map(Path::to_path_buf)
    }

    pub fn results_root(&self) -> PathBuf {
        expand(&self.results.root_dir)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let settings = &self.orchestrator;
        OrchestratorConfig {
            max_start_attempts: settings.max_start_attempts,
            start_backoff_base_ms: settings.start_backoff_base_ms,
            start_backoff_factor: settings.start_backoff_factor,
            max_job_age_ms: settings.max_job_age_secs.saturating_mul(1000),
            job_ttl_ms: settings.job_ttl_secs.saturating_mul(1000),
            call_timeout: Duration::from_secs(settings.call_timeout_secs),
            advance_concurrency: settings.advance_concurrency,
            enable_multi_tenancy: self.tenancy.enable_multi_tenancy,
            results_bucket: self.results.bucket.clone(),
            worker_type: self.runner.worker_type.clone(),
            worker_count: self.runner.worker_count,
        }
    }

    pub fn runner_config(&self) -> SubprocessRunnerConfig {
        SubprocessRunnerConfig {
            command: self.runner.command.clone(),
            args: self.runner.args.clone(),
            env_allowlist: self.runner.env_allowlist.clone(),
            results_root: self.results_root(),
            log_dir: expand(&self.runner.log_dir),
            max_concurrent_runs: self.runner.max_concurrent_runs,
            cpu_throttle_percent: self.runner.cpu_throttle_percent,
            min_free_memory_mb: self.runner.min_free_memory_mb,
            stop_grace_period: Duration::from_secs(self.runner.stop_grace_secs),
        }
    }

    pub fn signing_identity(&self) -> SigningIdentity {
        SigningIdentity {
            role: self.results.signer_role.clone(),
            bucket: self.results.bucket.clone(),
            key_id: self.results.signer_key_id.clone(),
        }
    }

    pub fn url_ttl_ms(&self) -> i64 {
        self.results.url_ttl_secs.saturating_mul(1000)
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            batch_size: self.maintenance.batch_size,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.sweep_interval_secs)
    }
}
