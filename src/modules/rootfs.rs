//! Root filesystem: bootstrap, pivot_root, and pseudo-filesystems.
//!
//! The child-side sequence is load-bearing: the rootfs must be a private
//! mount point before pivot_root, the old root is detached afterwards, and
//! /proc is mounted only once the new root is in place.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{MntFlags, MsFlags};

use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

const OLD_ROOT_DIR: &str = ".oldroot";
const DEBOOTSTRAP_MIRROR: &str = "http://archive.ubuntu.com/ubuntu/";

/// Ensures the rootfs exists (optionally via debootstrap) and swaps the
/// child into it with pivot_root.
pub struct RootFsModule {
    state: ModuleState,
    root_path: PathBuf,
    mount_ns_enabled: bool,
    pid_ns_enabled: bool,
}

impl RootFsModule {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            root_path: PathBuf::new(),
            mount_ns_enabled: false,
            pid_ns_enabled: false,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Shells out to debootstrap to create a minimal rootfs. Blocking; only
    /// runs when the configured path does not exist and auto_bootstrap is on.
    fn bootstrap(&self, ctx: &ModuleCtx) -> Result<()> {
        let sandbox = &ctx.config.sandbox;
        log::info!(
            "bootstrapping rootfs: {} {} into {}",
            sandbox.distro,
            sandbox.release,
            self.root_path.display()
        );

        let status = Command::new("debootstrap")
            .arg("--arch=amd64")
            .arg("--variant=minbase")
            .arg(&sandbox.release)
            .arg(&self.root_path)
            .arg(DEBOOTSTRAP_MIRROR)
            .status()
            .map_err(|e| SandboxError::Bootstrap(format!("failed to run debootstrap: {}", e)))?;

        if !status.success() {
            // Leave no half-written rootfs behind.
            if ctx.sys.exists(&self.root_path) {
                if let Err(e) = ctx.sys.remove_all(&self.root_path) {
                    log::warn!("failed to remove partial rootfs: {}", e);
                }
            }
            return Err(SandboxError::Bootstrap(format!(
                "debootstrap exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        log::info!("bootstrap completed");
        Ok(())
    }

    fn pivot_into_root(&self, ctx: &ModuleCtx) -> Result<()> {
        let sys = ctx.sys;
        let root = &self.root_path;

        // Bind the rootfs onto itself so it becomes a mount point eligible
        // for pivot_root, then stop mount events propagating to the host.
        sys.mount(
            Some(root),
            root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| SandboxError::Resource(format!("bind rootfs: {}", e)))?;

        sys.mount(
            None,
            root,
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| SandboxError::Resource(format!("make rootfs private: {}", e)))?;

        let put_old = root.join(OLD_ROOT_DIR);
        sys.mkdir_all(&put_old)
            .map_err(|e| SandboxError::Resource(format!("create old root dir: {}", e)))?;

        sys.pivot_root(root, &put_old)
            .map_err(|e| SandboxError::Resource(format!("pivot_root: {}", e)))?;

        sys.chdir(Path::new("/"))
            .map_err(|e| SandboxError::Resource(format!("chdir to new root: {}", e)))?;

        let old_root = Path::new("/").join(OLD_ROOT_DIR);
        sys.umount2(&old_root, MntFlags::MNT_DETACH)
            .map_err(|e| SandboxError::Resource(format!("detach old root: {}", e)))?;
        if let Err(e) = sys.remove_dir(&old_root) {
            log::warn!("failed to remove old root directory: {}", e);
        }

        Ok(())
    }

    fn mount_pseudo_filesystems(&self, ctx: &ModuleCtx) -> Result<()> {
        let sys = ctx.sys;
        let nodev_flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;

        if let Err(e) = sys.mount(
            Some(Path::new("proc")),
            Path::new("/proc"),
            Some("proc"),
            nodev_flags,
            None,
        ) {
            // Without /proc a PID namespace is useless; elsewhere it's
            // tolerable.
            if self.pid_ns_enabled {
                return Err(SandboxError::Resource(format!("mount /proc: {}", e)));
            }
            log::warn!("failed to mount /proc: {}", e);
        }

        if let Err(e) = sys.mount(
            Some(Path::new("sysfs")),
            Path::new("/sys"),
            Some("sysfs"),
            nodev_flags,
            None,
        ) {
            log::warn!("failed to mount /sys: {}", e);
        }

        if let Err(e) = sys.mount(
            Some(Path::new("tmpfs")),
            Path::new("/dev"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
        ) {
            log::warn!("failed to mount /dev: {}", e);
        }

        Ok(())
    }
}

impl Default for RootFsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for RootFsModule {
    fn name(&self) -> &'static str {
        "rootfs"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Filesystem
    }

    fn description(&self) -> &'static str {
        "root filesystem management via pivot_root and debootstrap"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        self.root_path = PathBuf::from(&ctx.config.sandbox.rootfs_path);
        self.mount_ns_enabled = ctx.config.isolation.has_namespace("mount");
        self.pid_ns_enabled = ctx.config.isolation.has_namespace("pid");

        if !ctx.sys.exists(&self.root_path) {
            if ctx.config.sandbox.auto_bootstrap {
                self.bootstrap(ctx)?;
            }
            if !ctx.sys.exists(&self.root_path) {
                self.state = ModuleState::Error;
                return Err(SandboxError::Resource(format!(
                    "rootfs does not exist: {}",
                    self.root_path.display()
                )));
            }
        }

        log::info!("rootfs ready at {}", self.root_path.display());
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&self, ctx: &ModuleCtx) -> Result<()> {
        if !self.mount_ns_enabled {
            log::debug!("mount namespace not requested; keeping host root");
            return Ok(());
        }

        log::info!("pivoting into {}", self.root_path.display());
        self.pivot_into_root(ctx)?;
        self.mount_pseudo_filesystems(ctx)?;
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SandboxConfiguration;
    use crate::kernel::syscall::{FakeSys, SysOp};

    fn ctx<'a>(config: &'a SandboxConfiguration, sys: &'a FakeSys) -> ModuleCtx<'a> {
        ModuleCtx::new(config, sys)
    }

    fn config_with_rootfs(path: &str) -> SandboxConfiguration {
        let mut config = SandboxConfiguration::default();
        config.sandbox.rootfs_path = path.to_string();
        config.sandbox.auto_bootstrap = false;
        config
    }

    #[test]
    fn missing_rootfs_without_bootstrap_is_an_error() {
        let config = config_with_rootfs("/srv/missing-rootfs");
        let sys = FakeSys::new();
        let mut module = RootFsModule::new();
        let err = module.initialize(&ctx(&config, &sys)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(module.state(), ModuleState::Error);
    }

    #[test]
    fn existing_rootfs_initializes() {
        let config = config_with_rootfs("/srv/rootfs");
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert_eq!(module.state(), ModuleState::Initialized);
        assert_eq!(module.root_path(), Path::new("/srv/rootfs"));
    }

    #[test]
    fn apply_performs_pivot_sequence_in_order() {
        let mut config = config_with_rootfs("/srv/rootfs");
        config.isolation.namespaces = vec!["mount".to_string(), "pid".to_string()];
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        sys.assert_subsequence(&[
            "mount /srv/rootfs /srv/rootfs",
            "mount  /srv/rootfs",
            "mkdir_all /srv/rootfs/.oldroot",
            "pivot_root /srv/rootfs",
            "chdir /",
            "umount2 /.oldroot",
            "mount proc /proc",
        ]);

        // First mount is the recursive self-bind, second marks it private.
        let mounts: Vec<SysOp> = sys
            .ops()
            .into_iter()
            .filter(|op| matches!(op, SysOp::Mount { .. }))
            .collect();
        match &mounts[0] {
            SysOp::Mount { flags, .. } => {
                assert_eq!(*flags, MsFlags::MS_BIND | MsFlags::MS_REC)
            }
            _ => unreachable!(),
        }
        match &mounts[1] {
            SysOp::Mount { flags, source, .. } => {
                assert_eq!(*flags, MsFlags::MS_PRIVATE | MsFlags::MS_REC);
                assert!(source.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn old_root_is_detached_not_unmounted_eagerly() {
        let mut config = config_with_rootfs("/srv/rootfs");
        config.isolation.namespaces = vec!["mount".to_string()];
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        let detach = sys.ops().into_iter().find_map(|op| match op {
            SysOp::Umount2 { target, flags } => Some((target, flags)),
            _ => None,
        });
        let (target, flags) = detach.unwrap();
        assert_eq!(target, Path::new("/.oldroot"));
        assert_eq!(flags, MntFlags::MNT_DETACH);
    }

    #[test]
    fn apply_is_a_no_op_without_mount_namespace() {
        let mut config = config_with_rootfs("/srv/rootfs");
        config.isolation.namespaces = vec!["pid".to_string()];
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        let before = sys.ops().len();
        module.apply_child(&ctx(&config, &sys)).unwrap();
        assert_eq!(sys.ops().len(), before);
    }

    #[test]
    fn proc_mount_failure_fatal_only_with_pid_namespace() {
        let mut config = config_with_rootfs("/srv/rootfs");
        config.isolation.namespaces = vec!["mount".to_string(), "pid".to_string()];
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");
        sys.fail_matching("mount proc /proc");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.apply_child(&ctx(&config, &sys)).is_err());

        // Same failure is only a warning without a PID namespace.
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");
        sys.fail_matching("mount proc /proc");
        config.isolation.namespaces = vec!["mount".to_string()];
        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.apply_child(&ctx(&config, &sys)).is_ok());
    }

    #[test]
    fn sys_and_dev_mount_failures_are_warnings() {
        let mut config = config_with_rootfs("/srv/rootfs");
        config.isolation.namespaces = vec!["mount".to_string()];
        let sys = FakeSys::new();
        sys.add_path("/srv/rootfs");
        sys.fail_matching("mount sysfs /sys");
        sys.fail_matching("mount tmpfs /dev");

        let mut module = RootFsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.apply_child(&ctx(&config, &sys)).is_ok());
    }

    #[test]
    fn module_identity() {
        let module = RootFsModule::new();
        assert_eq!(module.name(), "rootfs");
        assert_eq!(module.module_type(), ModuleType::Filesystem);
        assert!(module.dependencies().is_empty());
    }
}
