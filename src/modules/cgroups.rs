//! Cgroup v2 resource limits.
//!
//! A per-sandbox group named `sandbox-{name}-{parent_pid}` is created under
//! the unified hierarchy in the parent, the child pid is attached before the
//! child runs any privileged action, and the directory is removed after
//! reap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;

use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_USEC: u64 = 100_000;
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// Creates the per-sandbox cgroup, writes limits, and attaches the child.
pub struct CgroupsModule {
    state: ModuleState,
    cgroup_root: PathBuf,
    cgroup_path: Option<PathBuf>,
}

impl CgroupsModule {
    pub fn new() -> Self {
        Self::with_root(CGROUP_ROOT)
    }

    /// Uses a non-default hierarchy root (tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            state: ModuleState::Uninitialized,
            cgroup_root: root.into(),
            cgroup_path: None,
        }
    }

    /// Full path of the cgroup directory, once created.
    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup_path.as_deref()
    }

    fn write_limits(&self, ctx: &ModuleCtx, path: &Path) -> Result<()> {
        let resources = &ctx.config.resources;

        let memory_bytes = resources.memory_mb * 1024 * 1024;
        ctx.sys
            .write_file(&path.join("memory.max"), &memory_bytes.to_string())
            .map_err(|e| SandboxError::Resource(format!("memory.max: {}", e)))?;
        log::debug!("memory limit set to {} MB", resources.memory_mb);

        // High watermark triggers reclaim pressure before the hard limit.
        let memory_high = memory_bytes * 8 / 10;
        if let Err(e) = ctx
            .sys
            .write_file(&path.join("memory.high"), &memory_high.to_string())
        {
            log::warn!("failed to set memory.high: {}", e);
        }

        if !resources.enable_swap {
            if let Err(e) = ctx.sys.write_file(&path.join("memory.swap.max"), "0") {
                log::warn!("failed to set memory.swap.max: {}", e);
            }
        }

        let quota_usec = resources.cpu_quota_percent * 1000;
        ctx.sys
            .write_file(
                &path.join("cpu.max"),
                &format!("{} {}", quota_usec, CPU_PERIOD_USEC),
            )
            .map_err(|e| SandboxError::Resource(format!("cpu.max: {}", e)))?;
        log::debug!("cpu quota set to {}%", resources.cpu_quota_percent);

        if resources.max_pids > 0 {
            ctx.sys
                .write_file(&path.join("pids.max"), &resources.max_pids.to_string())
                .map_err(|e| SandboxError::Resource(format!("pids.max: {}", e)))?;
            log::debug!("pid limit set to {}", resources.max_pids);
        }

        Ok(())
    }
}

impl Default for CgroupsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CgroupsModule {
    fn name(&self) -> &'static str {
        "cgroups"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Isolation
    }

    fn description(&self) -> &'static str {
        "cgroup v2 resource limits for CPU, memory, and pid counts"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        let name = format!(
            "sandbox-{}-{}",
            ctx.config.sandbox.name,
            std::process::id()
        );
        let path = self.cgroup_root.join(&name);
        log::info!("creating cgroup {}", path.display());

        ctx.sys
            .mkdir_all(&path)
            .map_err(|e| SandboxError::Resource(format!("create cgroup: {}", e)))?;
        self.cgroup_path = Some(path.clone());

        if let Err(e) = self.write_limits(ctx, &path) {
            self.state = ModuleState::Error;
            return Err(e);
        }

        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn prepare_child(&mut self, ctx: &ModuleCtx, child: Pid) -> Result<()> {
        let path = self.cgroup_path.as_ref().ok_or_else(|| {
            SandboxError::Resource("cgroup was not created before prepare".to_string())
        })?;

        log::debug!("attaching pid {} to {}", child, path.display());
        ctx.sys
            .write_file(&path.join("cgroup.procs"), &child.as_raw().to_string())
            .map_err(|e| SandboxError::Resource(format!("cgroup.procs: {}", e)))?;

        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &ModuleCtx) -> Result<()> {
        if let Some(path) = self.cgroup_path.take() {
            // Removal can transiently fail with EBUSY while the kernel
            // finishes releasing the exited member.
            let mut last_err = None;
            for attempt in 0..REMOVE_ATTEMPTS {
                match ctx.sys.remove_dir(&path) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        last_err = Some(e);
                        if attempt + 1 < REMOVE_ATTEMPTS {
                            std::thread::sleep(REMOVE_BACKOFF);
                        }
                    }
                }
            }
            if let Some(e) = last_err {
                log::warn!("failed to remove cgroup {}: {}", path.display(), e);
            }
        }

        self.state = ModuleState::Stopped;
        Ok(())
    }
}
