//! Configured bind mounts inside the new root.
//!
//! Sources are host paths; after pivot_root they must resolve inside the new
//! root (or have been prepared there beforehand). This mirrors the known
//! limitation of running bind mounts after the root swap.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::mount::{MntFlags, MsFlags};

use crate::config::types::SandboxConfiguration;
use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

/// Applies configured bind mounts in order, optionally remounting read-only.
pub struct MountsModule {
    state: ModuleState,
    // Undo list; populated in apply order, unmounted in reverse.
    applied: Mutex<Vec<PathBuf>>,
}

impl MountsModule {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            applied: Mutex::new(Vec::new()),
        }
    }

    fn apply_bind_mount(
        &self,
        ctx: &ModuleCtx,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<()> {
        log::debug!(
            "bind mount {} -> {}{}",
            source.display(),
            target.display(),
            if read_only { " (ro)" } else { "" }
        );

        ctx.sys
            .mkdir_all(target)
            .map_err(|e| SandboxError::Resource(format!("create mount target: {}", e)))?;

        ctx.sys
            .mount(Some(source), target, None, MsFlags::MS_BIND, None)
            .map_err(|e| SandboxError::Resource(format!("bind mount: {}", e)))?;
        self.applied.lock().unwrap().push(target.to_path_buf());

        if read_only {
            if let Err(e) = ctx.sys.mount(
                None,
                target,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None,
            ) {
                log::warn!(
                    "failed to remount {} read-only: {}",
                    target.display(),
                    e
                );
            }
        }

        Ok(())
    }
}

impl Default for MountsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for MountsModule {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Filesystem
    }

    fn description(&self) -> &'static str {
        "bind mounts and volumes inside the sandbox filesystem"
    }

    fn dependencies(&self) -> &[&'static str] {
        &["rootfs"]
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn is_enabled(&self, config: &SandboxConfiguration) -> bool {
        !config.mounts.bind_mounts.is_empty()
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        for mount in &ctx.config.mounts.bind_mounts {
            log::debug!(
                "configured bind mount {} -> {}{}",
                mount.source,
                mount.target,
                if mount.read_only { " (ro)" } else { "" }
            );
        }
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&self, ctx: &ModuleCtx) -> Result<()> {
        for mount in &ctx.config.mounts.bind_mounts {
            self.apply_bind_mount(
                ctx,
                Path::new(&mount.source),
                Path::new(&mount.target),
                mount.read_only,
            )?;
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &ModuleCtx) -> Result<()> {
        let mut applied = self.applied.lock().unwrap();
        for target in applied.drain(..).rev() {
            log::debug!("unmounting {}", target.display());
            if let Err(e) = ctx.sys.umount2(&target, MntFlags::MNT_DETACH) {
                log::warn!("failed to unmount {}: {}", target.display(), e);
            }
        }
        self.state = ModuleState::Stopped;
        Ok(())
    }
}
