//! Lifecycle contract implemented by every isolation unit.
//!
//! The engine drives five hooks per module. Parent-side hooks take `&mut
//! self`; child-side hooks take `&self` because they run in the child's copy
//! of the address space after the clone and their state is invisible to the
//! parent.

use std::fmt;

use nix::unistd::Pid;

use crate::config::types::SandboxConfiguration;
use crate::error::Result;
use crate::kernel::syscall::Sys;

/// Current lifecycle state of a module. The engine's hook invocations drive
/// all transitions; ERROR is a sink reachable from any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Uninitialized => "uninitialized",
            ModuleState::Initialized => "initialized",
            ModuleState::Running => "running",
            ModuleState::Stopped => "stopped",
            ModuleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Category a module belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleType {
    Isolation,
    Filesystem,
    Security,
    Ai,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleType::Isolation => "isolation",
            ModuleType::Filesystem => "filesystem",
            ModuleType::Security => "security",
            ModuleType::Ai => "ai",
        };
        f.write_str(name)
    }
}

/// Context handed to every hook: the immutable configuration snapshot and the
/// syscall layer.
pub struct ModuleCtx<'a> {
    pub config: &'a SandboxConfiguration,
    pub sys: &'a dyn Sys,
}

impl<'a> ModuleCtx<'a> {
    pub fn new(config: &'a SandboxConfiguration, sys: &'a dyn Sys) -> Self {
        Self { config, sys }
    }
}

/// An isolation unit managed by the sandbox engine.
///
/// Hook timing:
///
/// | Hook            | Process | When |
/// |-----------------|---------|------|
/// | `initialize`    | parent  | before the clone |
/// | `prepare_child` | parent  | after the clone, child still blocked |
/// | `apply_child`   | child   | after namespace entry, before exec |
/// | `execute`       | child   | last, once |
/// | `cleanup`       | parent  | after reap or on any error path |
pub trait Module: Send {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn module_type(&self) -> ModuleType;

    fn description(&self) -> &'static str;

    /// Names of modules that must run before this one in forward phases (and
    /// after it in cleanup).
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    fn state(&self) -> ModuleState;

    fn is_enabled(&self, _config: &SandboxConfiguration) -> bool {
        true
    }

    /// Validate configuration and acquire parent-side resources. Failure
    /// aborts the whole run before the child is forked.
    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()>;

    /// Attach external state to the child pid (e.g. cgroup membership) while
    /// the child is still blocked on the sync pipe. Failure kills the child.
    fn prepare_child(&mut self, _ctx: &ModuleCtx, _child: Pid) -> Result<()> {
        Ok(())
    }

    /// In-namespace setup performed by the child before exec. Failure makes
    /// the child exit with status 1.
    fn apply_child(&self, _ctx: &ModuleCtx) -> Result<()> {
        Ok(())
    }

    /// Last hook in the child before the engine execs the user command.
    fn execute(&self, _ctx: &ModuleCtx) -> Result<i32> {
        Ok(0)
    }

    /// Release resources acquired in `initialize`. Invoked in reverse forward
    /// order; errors are logged and the remaining modules still run.
    fn cleanup(&mut self, ctx: &ModuleCtx) -> Result<()>;
}
