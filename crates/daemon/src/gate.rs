//! Admission control: only start production on an idle host.

use std::sync::Arc;

use anyhow::{Context, Result};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::config::GateConfig;

/// Host utilisation in percent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub ram_percent: f32,
}

/// Source of load samples; blocking is allowed.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> Result<LoadSample>;
}

/// Reads CPU and memory through `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl LoadProbe for SysinfoProbe {
    fn sample(&self) -> Result<LoadSample> {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        // CPU usage needs two refreshes spaced apart.
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_all();

        let total = sys.total_memory();
        if total == 0 {
            anyhow::bail!("total memory reported as zero");
        }
        Ok(LoadSample {
            cpu_percent: sys.global_cpu_usage(),
            ram_percent: (sys.used_memory() as f32 / total as f32) * 100.0,
        })
    }
}

/// Both readings strictly below their thresholds.
pub fn is_idle(sample: LoadSample, cpu_threshold: f32, ram_threshold: f32) -> bool {
    sample.cpu_percent < cpu_threshold && sample.ram_percent < ram_threshold
}

#[derive(Clone)]
pub struct ResourceGate {
    probe: Arc<dyn LoadProbe>,
    cpu_threshold: f32,
    ram_threshold: f32,
}

impl ResourceGate {
    pub fn new(probe: Arc<dyn LoadProbe>, cfg: &GateConfig) -> Self {
        Self {
            probe,
            cpu_threshold: cfg.cpu_threshold,
            ram_threshold: cfg.ram_threshold,
        }
    }

    /// `Ok(sample)` admits; `Err(reason)` postpones. A failed probe postpones.
    pub async fn check(&self) -> std::result::Result<LoadSample, String> {
        let probe = Arc::clone(&self.probe);
        let sample = tokio::task::spawn_blocking(move || probe.sample())
            .await
            .context("load probe panicked")
            .and_then(|r| r);
        match sample {
            Ok(s) if is_idle(s, self.cpu_threshold, self.ram_threshold) => Ok(s),
            Ok(s) => {
                let reason = format!(
                    "system busy: cpu {:.1}% (limit {:.1}%), ram {:.1}% (limit {:.1}%)",
                    s.cpu_percent, self.cpu_threshold, s.ram_percent, self.ram_threshold
                );
                tracing::info!(cpu = s.cpu_percent, ram = s.ram_percent, "resource gate denied run");
                Err(reason)
            }
            Err(e) => {
                tracing::info!(error = %e, "resource gate could not sample load; postponing");
                Err(format!("load unavailable: {e}"))
            }
        }
    }
}
