// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod maintenance;
pub mod object_store;
pub mod runner;
pub mod system_probe;
pub mod time_provider;
pub mod url_signer;

// Re-exports
pub use id_provider::IdProvider;
pub use job_store::{JobStore, UpdateOutcome};
pub use maintenance::{Maintenance, MaintenanceStats, RetentionConfig};
pub use object_store::{ObjectMetadata, ObjectStore, StorageError};
pub use runner::{JobRunner, RunnerError, RunnerParameters, RunnerStatus, StopOutcome};
pub use system_probe::{HostLoad, SystemProbe};
pub use time_provider::TimeProvider;
pub use url_signer::{SigningError, SigningIdentity, UrlSigner};
