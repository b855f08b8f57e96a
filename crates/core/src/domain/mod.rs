// Domain Layer - Export job entities and rules

pub mod error;
pub mod identity;
pub mod job;
pub mod manifest;
pub mod request;

// Re-exports
pub use error::DomainError;
pub use identity::{Grant, RequesterIdentity};
pub use job::{ExportJob, JobId, JobStatus, JobUpdate, OwnerId, RunnerHandle, TenantId};
pub use manifest::{Manifest, ManifestEntry, ObjectLocation, NDJSON_CONTENT_TYPE};
pub use request::{ExportRequest, ExportScope};
