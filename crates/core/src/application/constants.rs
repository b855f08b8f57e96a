// Orchestration defaults (no magic values)
use std::time::Duration;

/// Runner start attempts before a submitted job is failed
pub const DEFAULT_MAX_START_ATTEMPTS: u32 = 5;

/// Delay before the first start retry (30s)
pub const DEFAULT_START_BACKOFF_BASE_MS: i64 = 30_000;

/// Exponential backoff factor between start retries
pub const DEFAULT_START_BACKOFF_FACTOR: f64 = 2.0;

/// Absolute age ceiling of an export, measured from submission (12h)
pub const DEFAULT_MAX_JOB_AGE_MS: i64 = 12 * 60 * 60 * 1000;

/// Retention of job records and their results (72h)
pub const DEFAULT_JOB_TTL_MS: i64 = 72 * 60 * 60 * 1000;

/// Lifetime of signed download URLs (1h)
pub const DEFAULT_URL_TTL_MS: i64 = 60 * 60 * 1000;

/// Bound on every runner / store call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Jobs advanced in parallel by one scheduled pass
pub const DEFAULT_ADVANCE_CONCURRENCY: usize = 8;

/// Scheduled advance interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Retention sweep interval (1h)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Bucket receiving export results
pub const DEFAULT_RESULTS_BUCKET: &str = "bulk-export-results";

/// Compute worker sizes accepted by the runner
pub const SUPPORTED_WORKER_TYPES: [&str; 2] = ["G.1X", "G.2X"];

pub const DEFAULT_WORKER_TYPE: &str = "G.2X";

pub const DEFAULT_WORKER_COUNT: u32 = 5;

/// Re-reads allowed when a stop request loses a status race
pub const STOP_RACE_RETRIES: usize = 3;
