//! Host compute snapshot reported by the health endpoint.

use serde::{Deserialize, Serialize};
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};
use thiserror::Error;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry collection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// CPU and memory capacity of this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ComputeSnapshot {
    pub total_cpu_cores: usize,
    /// Cores not in use, estimated from global CPU usage
    pub free_cpu_cores: usize,
    pub cpu_model: String,
    pub cpu_mhz: u64,
    pub total_ram_gib: f64,
    pub free_ram_gib: f64,
}

impl ComputeSnapshot {
    pub fn cpu_ghz(&self) -> f64 {
        self.cpu_mhz as f64 / 1000.0
    }
}

/// Samples the host. Blocks for [`MINIMUM_CPU_UPDATE_INTERVAL`] to measure usage.
pub fn collect() -> ComputeSnapshot {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpus = sys.cpus();
    let total_cpu_cores = cpus.len();
    let (cpu_model, cpu_mhz) = cpus
        .first()
        .map(|cpu| (cpu.brand().trim().to_string(), cpu.frequency()))
        .unwrap_or_default();

    ComputeSnapshot {
        total_cpu_cores,
        free_cpu_cores: free_cores(total_cpu_cores, sys.global_cpu_usage()),
        cpu_model,
        cpu_mhz,
        total_ram_gib: sys.total_memory() as f64 / BYTES_PER_GIB,
        free_ram_gib: sys.available_memory() as f64 / BYTES_PER_GIB,
    }
}

/// [`collect`] on the blocking pool.
pub async fn snapshot() -> Result<ComputeSnapshot, TelemetryError> {
    Ok(tokio::task::spawn_blocking(collect).await?)
}

fn free_cores(total: usize, usage_percent: f32) -> usize {
    let busy = (total as f32 * usage_percent.clamp(0.0, 100.0) / 100.0).ceil() as usize;
    total.saturating_sub(busy)
}
