// Central Error Type for the Export Service

use thiserror::Error;

/// Application-level error type
///
/// The first eight variants are the caller-facing taxonomy; the rest are
/// infrastructure failures surfaced by adapters.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Runner unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("Runner failure: {0}")]
    RunnerFailure(String),

    #[error("Packaging failure: {0}")]
    PackagingFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExportError {
    /// Errors worth retrying on a later pass; they never fail a job
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExportError::RunnerUnavailable(_) | ExportError::Conflict(_) | ExportError::Timeout(_)
        )
    }
}

impl From<crate::port::RunnerError> for ExportError {
    fn from(err: crate::port::RunnerError) -> Self {
        use crate::port::RunnerError;
        match err {
            RunnerError::Unavailable(msg) => ExportError::RunnerUnavailable(msg),
            other => ExportError::RunnerFailure(other.to_string()),
        }
    }
}

/// Result type alias using ExportError
pub type Result<T> = std::result::Result<T, ExportError>;

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to ExportError::Database(String)
