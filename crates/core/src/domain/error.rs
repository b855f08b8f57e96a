// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid export request: {0}")]
    InvalidRequest(String),

    #[error("Invalid object location: {0}")]
    InvalidLocation(String),

    #[error("Job invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
