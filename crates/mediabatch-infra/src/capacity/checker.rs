use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sysinfo::{Disks, System};
use tracing::{error, warn};

use mediabatch_core::{AppError, CapacityGate, Config};

/// Probes host resources against the configured thresholds.
///
/// Each check honors its `*_check_behavior` setting: `fail` turns pressure
/// into an error, `warn` logs it and lets the caller proceed.
#[derive(Clone)]
pub struct CapacityChecker {
    config: Config,
    system: Arc<Mutex<System>>,
}

impl CapacityChecker {
    pub fn new(config: Config) -> Self {
        let mut system = System::new();
        system.refresh_all();

        Self {
            config,
            system: Arc::new(Mutex::new(system)),
        }
    }

    /// Verifies the filesystem holding `path` can absorb `required_bytes`
    /// on top of the configured free-space floor.
    pub fn check_disk_space(&self, path: &Path, required_bytes: u64) -> Result<()> {
        let floor = self.config.min_disk_free_gb() * 1024 * 1024 * 1024;
        let needed = required_bytes.saturating_add(floor);

        let resolved = path
            .canonicalize()
            .with_context(|| format!("Cannot resolve path for disk check: {}", path.display()))?;

        // Longest matching mount point wins for nested mounts.
        let disks = Disks::new_with_refreshed_list();
        let available = disks
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| anyhow!("No mount found for path: {}", path.display()))?;

        if available >= needed {
            return Ok(());
        }
        apply_behavior(
            &self.config.disk_check_behavior(),
            "disk_check_behavior",
            AppError::InsufficientDiskSpace {
                available,
                required: needed,
            },
        )
    }

    /// Verifies `required_bytes` of memory are free and that overall usage
    /// sits under the configured ceiling.
    pub fn check_memory(&self, required_bytes: u64) -> Result<()> {
        let (available, usage_percent) = {
            let mut system = self.lock_system("memory")?;
            system.refresh_memory();
            let total = system.total_memory();
            let used = system.used_memory();
            (total.saturating_sub(used), used as f64 / total as f64 * 100.0)
        };

        if available < required_bytes {
            apply_behavior(
                &self.config.memory_check_behavior(),
                "memory_check_behavior",
                AppError::InsufficientMemory {
                    available,
                    required: required_bytes,
                },
            )?;
        }

        let ceiling = self.config.max_memory_usage_percent();
        if usage_percent > ceiling {
            apply_behavior(
                &self.config.memory_check_behavior(),
                "memory_check_behavior",
                AppError::HighMemoryUsage {
                    usage_percent,
                    threshold: ceiling,
                },
            )?;
        }

        Ok(())
    }

    pub fn check_cpu_usage(&self) -> Result<()> {
        let usage = {
            let mut system = self.lock_system("cpu")?;
            system.refresh_cpu();
            // Average across all cores.
            let cpus = system.cpus();
            if cpus.is_empty() {
                0.0
            } else {
                f64::from(cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>()) / cpus.len() as f64
            }
        };

        let ceiling = self.config.max_cpu_usage_percent();
        if usage > ceiling {
            return apply_behavior(
                &self.config.cpu_check_behavior(),
                "cpu_check_behavior",
                AppError::HighCpuUsage {
                    usage_percent: usage,
                    threshold: ceiling,
                },
            );
        }
        Ok(())
    }

    pub async fn check_disk_space_async(&self, path: &Path, required_bytes: u64) -> Result<()> {
        let path = path.to_path_buf();
        self.run_blocking("disk", move |checker| {
            checker.check_disk_space(&path, required_bytes)
        })
        .await
    }

    pub async fn check_memory_async(&self, required_bytes: u64) -> Result<()> {
        self.run_blocking("memory", move |checker| checker.check_memory(required_bytes))
            .await
    }

    pub async fn check_cpu_usage_async(&self) -> Result<()> {
        self.run_blocking("cpu", |checker| checker.check_cpu_usage())
            .await
    }

    /// Runs a sysinfo probe on the blocking pool so callers never stall
    /// the async runtime on filesystem or /proc reads.
    async fn run_blocking<F>(&self, probe: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(CapacityChecker) -> Result<()> + Send + 'static,
    {
        let checker = self.clone();
        tokio::task::spawn_blocking(move || f(checker))
            .await
            .map_err(|e| anyhow!("{} capacity probe did not complete: {}", probe, e))?
    }

    fn lock_system(&self, probe: &str) -> Result<MutexGuard<'_, System>> {
        self.system.lock().map_err(|e| {
            error!(probe = probe, error = %e, "System state mutex poisoned");
            anyhow!("Cannot inspect host {}: mutex poisoned", probe)
        })
    }
}

/// Applies a check's configured behavior to a detected pressure condition.
fn apply_behavior(behavior: &str, knob: &'static str, pressure: AppError) -> Result<()> {
    match behavior {
        "fail" => {
            error!(check = knob, error = %pressure, "Capacity check failed");
            Err(pressure.into())
        }
        "warn" => {
            warn!(check = knob, error = %pressure, "Capacity check failed (warning only)");
            Ok(())
        }
        other => {
            warn!(behavior = other, knob, "Unknown check behavior, treating as warn");
            Ok(())
        }
    }
}

#[async_trait]
impl CapacityGate for CapacityChecker {
    /// All three probes must pass for another processing stage to start.
    async fn can_accept_task(&self) -> bool {
        let staging_dir = self.config.staging_dir().clone();
        let disk_ok = match self.check_disk_space_async(&staging_dir, 0).await {
            Ok(()) => true,
            // A failed probe (missing dir, unknown mount) is not a pressure signal.
            Err(e) if e.downcast_ref::<AppError>().is_none() => {
                warn!(error = %e, "Disk capacity probe failed, skipping disk gate");
                true
            }
            Err(_) => false,
        };
        let memory_ok = self.check_memory_async(0).await.is_ok();
        let cpu_ok = self.check_cpu_usage_async().await.is_ok();

        disk_ok && memory_ok && cpu_ok
    }
}
