// Application Layer - Use Cases and Business Logic

pub mod access;
pub mod config;
pub mod constants;
pub mod maintenance;
pub mod orchestrator;
pub mod packager;
pub mod retry;
pub mod scheduler;
pub mod shutdown;

// Re-exports
pub use access::{AccessDecision, AccessGate, Operation};
pub use config::OrchestratorConfig;
pub use maintenance::{RetentionSweeper, SweepReport};
pub use orchestrator::{
    AdvanceOutcome, AdvanceReport, ExportOrchestrator, JobStatusView, StopAcknowledgement,
};
pub use packager::ResultPackager;
pub use retry::{RetryDecision, StartRetryPolicy};
pub use scheduler::AdvanceScheduler;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
