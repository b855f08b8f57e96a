// Host load port
// The local runner consults it before spawning an extraction
use async_trait::async_trait;

/// Point-in-time view of host load
#[derive(Debug, Clone, PartialEq)]
pub struct HostLoad {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

impl HostLoad {
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }

    /// Why the host cannot take another extraction, if it cannot
    ///
    /// # Arguments
    /// * `cpu_ceiling_percent` - Refuse above this CPU usage
    /// * `min_free_memory_mb` - Refuse below this much free memory
    pub fn saturation(&self, cpu_ceiling_percent: f32, min_free_memory_mb: u64) -> Option<String> {
        if self.cpu_usage_percent > cpu_ceiling_percent {
            return Some(format!(
                "host CPU at {:.1}% (ceiling {:.1}%)",
                self.cpu_usage_percent, cpu_ceiling_percent
            ));
        }
        if self.memory_free_mb() < min_free_memory_mb {
            return Some(format!(
                "{}MB free memory, extraction needs {}MB",
                self.memory_free_mb(),
                min_free_memory_mb
            ));
        }
        None
    }
}

#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn host_load(&self) -> HostLoad;
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Fixed host load, adjustable between calls
    pub struct MockSystemProbe {
        load: Mutex<HostLoad>,
    }

    impl MockSystemProbe {
        /// 2GB host with 1GB used
        pub fn new(cpu_usage_percent: f32) -> Self {
            Self {
                load: Mutex::new(HostLoad {
                    cpu_usage_percent,
                    memory_used_mb: 1024,
                    memory_total_mb: 2048,
                }),
            }
        }

        pub fn set_cpu_usage(&self, cpu_usage_percent: f32) {
            self.load.lock().unwrap().cpu_usage_percent = cpu_usage_percent;
        }

        pub fn set_memory_used(&self, memory_used_mb: u64) {
            self.load.lock().unwrap().memory_used_mb = memory_used_mb;
        }
    }

    #[async_trait]
    impl SystemProbe for MockSystemProbe {
        async fn host_load(&self) -> HostLoad {
            self.load.lock().unwrap().clone()
        }
    }
}
