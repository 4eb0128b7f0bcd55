//! Capability restriction.
//!
//! Applied in the child strictly after seccomp install and before exec. The
//! kept set lands in the effective, permitted, inheritable, and ambient
//! masks; everything else is dropped from the bounding set so the
//! restriction survives execve.

use std::str::FromStr;

use caps::{Capability, CapsHashSet};
use nix::errno::Errno;

use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

/// Translates capability names from the configuration. Unknown names produce
/// a warning and are ignored.
pub fn parse_capabilities(names: &[String]) -> CapsHashSet {
    let mut keep = CapsHashSet::new();
    for name in names {
        match Capability::from_str(name) {
            Ok(cap) => {
                keep.insert(cap);
            }
            Err(_) => log::warn!("unknown capability: {}", name),
        }
    }
    keep
}

/// Clears then sets the process capability masks to the configured kept set.
pub struct CapsModule {
    state: ModuleState,
    keep: CapsHashSet,
}

impl CapsModule {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            keep: CapsHashSet::new(),
        }
    }

    pub fn kept(&self) -> &CapsHashSet {
        &self.keep
    }
}

impl Default for CapsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CapsModule {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Security
    }

    fn description(&self) -> &'static str {
        "Linux capability masks for fine-grained privilege control"
    }

    fn dependencies(&self) -> &[&'static str] {
        &["seccomp"]
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        self.keep = parse_capabilities(&ctx.config.security.capabilities);
        log::info!(
            "caps module initialized, keeping {} capabilities",
            self.keep.len()
        );
        for cap in &self.keep {
            log::debug!("  keeping {}", cap);
        }
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&self, ctx: &ModuleCtx) -> Result<()> {
        // An empty kept list is valid: the process ends with no capabilities.
        ctx.sys
            .cap_set_proc(&self.keep)
            .map_err(|e| SandboxError::Security(format!("set capability masks: {}", e)))?;

        // Ambient raises keep the capability across execve for non-setuid
        // binaries (Linux 4.3+); older kernels just refuse.
        for cap in &self.keep {
            if let Err(e) = ctx.sys.cap_raise_ambient(*cap) {
                log::warn!("failed to raise ambient capability {}: {}", cap, e);
            }
        }

        // Bounding-set shrink makes the restriction hold across execve.
        // EINVAL means the kernel does not know the capability at all.
        for cap in caps::all() {
            if self.keep.contains(&cap) {
                continue;
            }
            if let Err(e) = ctx.sys.cap_drop_bounding(cap) {
                if e.errno == Some(Errno::EINVAL) {
                    log::debug!("kernel does not support {}: skipping bounding drop", cap);
                } else {
                    return Err(SandboxError::Security(format!(
                        "drop {} from bounding set: {}",
                        cap, e
                    )));
                }
            }
        }

        Ok(())
    }

    fn cleanup(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        self.keep.clear();
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

    fn config_with_caps(names: &[&str]) -> SandboxConfiguration {
        let mut config = SandboxConfiguration::default();
        config.security.capabilities = names.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn known_names_translate_and_unknown_are_ignored() {
        let keep = parse_capabilities(&[
            "CAP_NET_BIND_SERVICE".to_string(),
            "CAP_CHOWN".to_string(),
            "CAP_FLY_TO_THE_MOON".to_string(),
        ]);
        assert_eq!(keep.len(), 2);
        assert!(keep.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert!(keep.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn apply_sets_masks_with_kept_capabilities() {
        let config = config_with_caps(&["CAP_NET_BIND_SERVICE"]);
        let sys = FakeSys::new();
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        let set_op = sys.ops().into_iter().find_map(|op| match op {
            SysOp::CapSetProc { keep } => Some(keep),
            _ => None,
        });
        assert_eq!(set_op.unwrap(), vec!["CAP_NET_BIND_SERVICE".to_string()]);
    }

    #[test]
    fn kept_capabilities_are_raised_ambient() {
        let config = config_with_caps(&["CAP_NET_BIND_SERVICE"]);
        let sys = FakeSys::new();
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        let raised: Vec<String> = sys
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                SysOp::CapRaiseAmbient { cap } => Some(cap),
                _ => None,
            })
            .collect();
        assert_eq!(raised, vec!["CAP_NET_BIND_SERVICE".to_string()]);
    }

    #[test]
    fn bounding_set_dropped_for_everything_not_kept() {
        let config = config_with_caps(&["CAP_NET_BIND_SERVICE"]);
        let sys = FakeSys::new();
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        let dropped: Vec<String> = sys
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                SysOp::CapDropBounding { cap } => Some(cap),
                _ => None,
            })
            .collect();
        assert_eq!(dropped.len(), caps::all().len() - 1);
        assert!(!dropped.contains(&"CAP_NET_BIND_SERVICE".to_string()));
    }

    #[test]
    fn empty_kept_list_is_valid() {
        let config = config_with_caps(&[]);
        let sys = FakeSys::new();
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        let set_op = sys.ops().into_iter().find_map(|op| match op {
            SysOp::CapSetProc { keep } => Some(keep),
            _ => None,
        });
        assert!(set_op.unwrap().is_empty());
    }

    #[test]
    fn mask_set_failure_is_a_security_error() {
        let config = config_with_caps(&[]);
        let sys = FakeSys::new();
        sys.fail_matching("cap_set_proc");
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();

        let err = module.apply_child(&ctx(&config, &sys)).unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn ambient_failure_is_only_a_warning() {
        let config = config_with_caps(&["CAP_CHOWN"]);
        let sys = FakeSys::new();
        sys.fail_matching("cap_raise_ambient");
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.apply_child(&ctx(&config, &sys)).is_ok());
    }

    #[test]
    fn bounding_drop_eperm_is_a_security_error() {
        let config = config_with_caps(&[]);
        let sys = FakeSys::new();
        sys.fail_matching("cap_drop_bounding");
        let mut module = CapsModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();

        let err = module.apply_child(&ctx(&config, &sys)).unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn module_identity() {
        let module = CapsModule::new();
        assert_eq!(module.name(), "caps");
        assert_eq!(module.dependencies(), &["seccomp"]);
        assert_eq!(module.module_type(), ModuleType::Security);
    }
}
