// FHIR Export Infrastructure - System Adapters
// Implements: SystemProbe, JobRunner (local subprocess extraction engine)

pub mod subprocess_runner;
pub mod system_probe_impl;

pub use subprocess_runner::{SubprocessRunner, SubprocessRunnerConfig};
pub use system_probe_impl::SystemProbeImpl;
