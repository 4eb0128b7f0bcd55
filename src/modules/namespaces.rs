//! Namespace isolation: clone-flag selection and user-namespace id maps.
//!
//! The engine clones the child with the flags computed here, so by the time
//! `apply_child` runs the child is already inside the requested namespaces.
//! Procfs and sysfs mounting is deferred to the rootfs module so it orders
//! correctly with pivot_root.

use std::path::Path;

use nix::sched::CloneFlags;

use crate::config::types::IsolationSection;
use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

/// Maps a configured namespace name to its clone flag.
fn namespace_flag(name: &str) -> CloneFlags {
    match name {
        "pid" => CloneFlags::CLONE_NEWPID,
        "net" => CloneFlags::CLONE_NEWNET,
        "ipc" => CloneFlags::CLONE_NEWIPC,
        "uts" => CloneFlags::CLONE_NEWUTS,
        "mount" => CloneFlags::CLONE_NEWNS,
        "user" => CloneFlags::CLONE_NEWUSER,
        _ => CloneFlags::empty(),
    }
}

/// OR of the clone flags for the configured namespace set. Used by the
/// engine when cloning the child.
pub fn clone_flags(isolation: &IsolationSection) -> CloneFlags {
    isolation
        .namespaces
        .iter()
        .fold(CloneFlags::empty(), |acc, ns| acc | namespace_flag(ns))
}

/// Requests the configured namespace set and writes uid/gid maps in the
/// child.
pub struct NamespacesModule {
    state: ModuleState,
    user_ns_enabled: bool,
    uts_enabled: bool,
    flags: CloneFlags,
}

impl NamespacesModule {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            user_ns_enabled: false,
            uts_enabled: false,
            flags: CloneFlags::empty(),
        }
    }

    pub fn flags(&self) -> CloneFlags {
        self.flags
    }

    /// Writes `deny` to setgroups, then the uid and gid maps. The kernel
    /// accepts each map write exactly once per namespace.
    fn apply_user_namespace(&self, ctx: &ModuleCtx) -> Result<()> {
        if let Err(e) = ctx
            .sys
            .write_file(Path::new("/proc/self/setgroups"), "deny")
        {
            log::warn!("failed to write /proc/self/setgroups: {}", e);
        }

        let uid_map = ctx.config.isolation.uid_map.ok_or_else(|| {
            SandboxError::Namespace("user namespace requested without uid_map".to_string())
        })?;
        let line = format!(
            "{} {} {}",
            uid_map.container_uid, uid_map.host_uid, uid_map.count
        );
        ctx.sys
            .write_file(Path::new("/proc/self/uid_map"), &line)
            .map_err(|e| SandboxError::Namespace(format!("uid_map: {}", e)))?;
        log::debug!("uid map: {}", line);

        let gid_map = ctx.config.isolation.gid_map.ok_or_else(|| {
            SandboxError::Namespace("user namespace requested without gid_map".to_string())
        })?;
        let line = format!(
            "{} {} {}",
            gid_map.container_gid, gid_map.host_gid, gid_map.count
        );
        ctx.sys
            .write_file(Path::new("/proc/self/gid_map"), &line)
            .map_err(|e| SandboxError::Namespace(format!("gid_map: {}", e)))?;
        log::debug!("gid map: {}", line);

        Ok(())
    }
}

impl Default for NamespacesModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for NamespacesModule {
    fn name(&self) -> &'static str {
        "namespaces"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Isolation
    }

    fn description(&self) -> &'static str {
        "Linux namespace isolation for pid, net, ipc, uts, mount, and user namespaces"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        self.user_ns_enabled = ctx.config.isolation.has_namespace("user");
        self.uts_enabled = ctx.config.isolation.has_namespace("uts");
        self.flags = clone_flags(&ctx.config.isolation);

        log::info!(
            "namespaces module initialized: {:?} (user ns: {})",
            ctx.config.isolation.namespaces,
            self.user_ns_enabled
        );
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&self, ctx: &ModuleCtx) -> Result<()> {
        if self.user_ns_enabled {
            self.apply_user_namespace(ctx)?;
        }

        if self.uts_enabled {
            // Hostname is cosmetic; failure does not abort the run.
            if let Err(e) = ctx.sys.sethostname(&ctx.config.sandbox.hostname) {
                log::warn!("failed to set hostname: {}", e);
            }
        }

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

    #[test]
    fn clone_flags_cover_requested_namespaces() {
        let isolation = IsolationSection {
            namespaces: vec![
                "pid".to_string(),
                "mount".to_string(),
                "user".to_string(),
                "uts".to_string(),
            ],
            ..Default::default()
        };
        let flags = clone_flags(&isolation);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWIPC));
    }

    #[test]
    fn clone_flags_empty_for_no_namespaces() {
        let isolation = IsolationSection {
            namespaces: Vec::new(),
            ..Default::default()
        };
        assert!(clone_flags(&isolation).is_empty());
    }

    #[test]
    fn apply_writes_setgroups_then_uid_then_gid_map() {
        let mut config = SandboxConfiguration::default();
        config.isolation.namespaces = vec!["user".to_string()];

        let sys = FakeSys::new();
        let mut module = NamespacesModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        sys.assert_subsequence(&[
            "write_file /proc/self/setgroups",
            "write_file /proc/self/uid_map",
            "write_file /proc/self/gid_map",
        ]);
        assert_eq!(sys.writes_to("setgroups"), vec!["deny"]);
        assert_eq!(sys.writes_to("uid_map"), vec!["0 1000 1"]);
        assert_eq!(sys.writes_to("gid_map"), vec!["0 1000 1"]);
    }

    #[test]
    fn each_map_is_written_exactly_once() {
        let mut config = SandboxConfiguration::default();
        config.isolation.namespaces = vec!["user".to_string()];

        let sys = FakeSys::new();
        let mut module = NamespacesModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        assert_eq!(sys.writes_to("uid_map").len(), 1);
        assert_eq!(sys.writes_to("gid_map").len(), 1);
    }

    #[test]
    fn uid_map_write_failure_is_fatal() {
        let mut config = SandboxConfiguration::default();
        config.isolation.namespaces = vec!["user".to_string()];

        let sys = FakeSys::new();
        sys.fail_matching("uid_map");
        let mut module = NamespacesModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();

        let err = module.apply_child(&ctx(&config, &sys)).unwrap_err();
        assert!(matches!(err, SandboxError::Namespace(_)));
        // No gid map write once the uid map failed.
        assert!(sys.writes_to("gid_map").is_empty());
    }

    #[test]
    fn hostname_failure_is_only_a_warning() {
        let mut config = SandboxConfiguration::default();
        config.isolation.namespaces = vec!["uts".to_string()];

        let sys = FakeSys::new();
        sys.fail_matching("sethostname");
        let mut module = NamespacesModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.apply_child(&ctx(&config, &sys)).is_ok());
    }

    #[test]
    fn hostname_set_for_uts_namespace() {
        let mut config = SandboxConfiguration::default();
        config.isolation.namespaces = vec!["uts".to_string()];
        config.sandbox.hostname = "testbox".to_string();

        let sys = FakeSys::new();
        let mut module = NamespacesModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        assert_eq!(
            sys.ops(),
            vec![SysOp::Sethostname {
                name: "testbox".to_string()
            }]
        );
    }

    #[test]
    fn module_identity() {
        let module = NamespacesModule::new();
        assert_eq!(module.name(), "namespaces");
        assert_eq!(module.module_type(), ModuleType::Isolation);
        assert!(module.dependencies().is_empty());
        assert_eq!(module.state(), ModuleState::Uninitialized);
    }
}
