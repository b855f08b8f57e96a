// sysinfo-backed host load probe
use async_trait::async_trait;
use std::sync::Mutex;
use sysinfo::System;
use tracing::debug;

use fhir_export_core::port::system_probe::{HostLoad, SystemProbe};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Host load read through sysinfo
///
/// CPU usage is a delta between refreshes, so the probe keeps one `System`
/// alive and primes it at construction.
pub struct SystemProbeImpl {
    system: Mutex<System>,
}

impl SystemProbeImpl {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbeImpl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SystemProbeImpl {
    async fn host_load(&self) -> HostLoad {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let load = HostLoad {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: system.used_memory() / BYTES_PER_MB,
            memory_total_mb: system.total_memory() / BYTES_PER_MB,
        };
        debug!(
            cpu = load.cpu_usage_percent,
            memory_free_mb = load.memory_free_mb(),
            "Host load sampled"
        );
        load
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_load_is_plausible() {
        let probe = SystemProbeImpl::default();
        let load = probe.host_load().await;

        assert!((0.0..=100.0).contains(&load.cpu_usage_percent));
        assert!(load.memory_total_mb > 0);
        assert!(load.memory_free_mb() <= load.memory_total_mb);
        // A permissive ceiling never reports saturation
        assert_eq!(load.saturation(100.0, 0), None);
    }
}
