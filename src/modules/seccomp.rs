//! Seccomp-BPF syscall filtering.
//!
//! The filter is compiled once in the parent (deterministic given the policy
//! and allow-list) and installed in the child after all filesystem setup but
//! before capability restriction. `PR_SET_NO_NEW_PRIVS` must be set first or
//! the kernel refuses the filter for unprivileged callers.

use std::collections::BTreeMap;
use std::path::Path;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use crate::config::types::SandboxConfiguration;
use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

/// Default action applied to syscalls outside the allow-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeccompPolicy {
    /// Deny with EPERM.
    Default,
    /// Kill the whole process.
    Strict,
    /// Log and allow.
    Log,
    /// Allow everything; no filter is installed.
    Allow,
    /// Module disabled entirely.
    Off,
}

impl SeccompPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "default" => Some(SeccompPolicy::Default),
            "strict" => Some(SeccompPolicy::Strict),
            "log" => Some(SeccompPolicy::Log),
            "allow" => Some(SeccompPolicy::Allow),
            "off" => Some(SeccompPolicy::Off),
            _ => None,
        }
    }

    fn mismatch_action(self) -> Option<SeccompAction> {
        match self {
            SeccompPolicy::Default => Some(SeccompAction::Errno(libc::EPERM as u32)),
            SeccompPolicy::Strict => Some(SeccompAction::KillProcess),
            SeccompPolicy::Log => Some(SeccompAction::Log),
            SeccompPolicy::Allow | SeccompPolicy::Off => None,
        }
    }
}

/// Essential syscalls of a POSIX-ish runtime: file I/O, memory management,
/// signals, synchronization, scheduling, clocks, process inquiry and exit.
const DEFAULT_ALLOWLIST: &[&str] = &[
    "read", "write", "readv", "writev", "pread64", "pwrite64", "open", "openat", "close",
    "lseek", "dup", "dup2", "dup3", "pipe", "pipe2", "fcntl", "flock", "fsync", "fdatasync",
    "ftruncate", "truncate", "access", "faccessat", "readlink", "readlinkat", "getcwd",
    "chdir", "fchdir", "mkdir", "rmdir", "rename", "unlink", "link", "stat", "fstat",
    "lstat", "newfstatat", "statx", "getdents64", "ioctl", "brk", "mmap", "mprotect",
    "munmap", "mremap", "madvise", "msync", "mincore", "execve", "exit", "exit_group",
    "getpid", "gettid", "getppid", "getuid", "geteuid", "getgid", "getegid", "getrandom",
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack", "futex",
    "sched_yield", "sched_getaffinity", "sched_setaffinity", "nanosleep", "clock_gettime",
    "clock_getres", "clock_nanosleep", "gettimeofday", "timer_create", "timer_settime",
    "timer_gettime", "timer_delete", "getitimer", "setitimer", "uname", "wait4", "kill",
    "tgkill", "set_tid_address", "set_robust_list", "prlimit64", "getrlimit", "getrusage",
    "arch_prctl", "rseq",
];

/// Resolves a syscall name to its number on this architecture. Names the
/// kernel on this target does not provide resolve to `None`.
fn resolve_syscall(name: &str) -> Option<i64> {
    let nr = match name {
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "open" => libc::SYS_open,
        "openat" => libc::SYS_openat,
        "close" => libc::SYS_close,
        "lseek" => libc::SYS_lseek,
        "dup" => libc::SYS_dup,
        "dup2" => libc::SYS_dup2,
        "dup3" => libc::SYS_dup3,
        "pipe" => libc::SYS_pipe,
        "pipe2" => libc::SYS_pipe2,
        "fcntl" => libc::SYS_fcntl,
        "flock" => libc::SYS_flock,
        "fsync" => libc::SYS_fsync,
        "fdatasync" => libc::SYS_fdatasync,
        "ftruncate" => libc::SYS_ftruncate,
        "truncate" => libc::SYS_truncate,
        "access" => libc::SYS_access,
        "faccessat" => libc::SYS_faccessat,
        "readlink" => libc::SYS_readlink,
        "readlinkat" => libc::SYS_readlinkat,
        "getcwd" => libc::SYS_getcwd,
        "chdir" => libc::SYS_chdir,
        "fchdir" => libc::SYS_fchdir,
        "mkdir" => libc::SYS_mkdir,
        "rmdir" => libc::SYS_rmdir,
        "rename" => libc::SYS_rename,
        "unlink" => libc::SYS_unlink,
        "link" => libc::SYS_link,
        "stat" => libc::SYS_stat,
        "fstat" => libc::SYS_fstat,
        "lstat" => libc::SYS_lstat,
        "newfstatat" => libc::SYS_newfstatat,
        "statx" => libc::SYS_statx,
        "getdents64" => libc::SYS_getdents64,
        "ioctl" => libc::SYS_ioctl,
        "brk" => libc::SYS_brk,
        "mmap" => libc::SYS_mmap,
        "mprotect" => libc::SYS_mprotect,
        "munmap" => libc::SYS_munmap,
        "mremap" => libc::SYS_mremap,
        "madvise" => libc::SYS_madvise,
        "msync" => libc::SYS_msync,
        "mincore" => libc::SYS_mincore,
        "execve" => libc::SYS_execve,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "getpid" => libc::SYS_getpid,
        "gettid" => libc::SYS_gettid,
        "getppid" => libc::SYS_getppid,
        "getuid" => libc::SYS_getuid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getegid" => libc::SYS_getegid,
        "getrandom" => libc::SYS_getrandom,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "sigaltstack" => libc::SYS_sigaltstack,
        "futex" => libc::SYS_futex,
        "sched_yield" => libc::SYS_sched_yield,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_setaffinity" => libc::SYS_sched_setaffinity,
        "nanosleep" => libc::SYS_nanosleep,
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "gettimeofday" => libc::SYS_gettimeofday,
        "timer_create" => libc::SYS_timer_create,
        "timer_settime" => libc::SYS_timer_settime,
        "timer_gettime" => libc::SYS_timer_gettime,
        "timer_delete" => libc::SYS_timer_delete,
        "getitimer" => libc::SYS_getitimer,
        "setitimer" => libc::SYS_setitimer,
        "uname" => libc::SYS_uname,
        "wait4" => libc::SYS_wait4,
        "kill" => libc::SYS_kill,
        "tgkill" => libc::SYS_tgkill,
        "set_tid_address" => libc::SYS_set_tid_address,
        "set_robust_list" => libc::SYS_set_robust_list,
        "prlimit64" => libc::SYS_prlimit64,
        "getrlimit" => libc::SYS_getrlimit,
        "getrusage" => libc::SYS_getrusage,
        "arch_prctl" => libc::SYS_arch_prctl,
        "rseq" => libc::SYS_rseq,
        _ => return None,
    };
    Some(nr)
}

fn target_arch() -> Result<TargetArch> {
    if cfg!(target_arch = "x86_64") {
        Ok(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(TargetArch::aarch64)
    } else {
        Err(SandboxError::Security(
            "unsupported architecture for seccomp filtering".to_string(),
        ))
    }
}

/// Compiles an allow-list BPF filter and installs it before exec.
pub struct SeccompModule {
    state: ModuleState,
    policy: SeccompPolicy,
    program: Option<BpfProgram>,
}

impl SeccompModule {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            policy: SeccompPolicy::Default,
            program: None,
        }
    }

    pub fn policy(&self) -> SeccompPolicy {
        self.policy
    }

    /// The compiled filter, if the policy requires one.
    pub fn program(&self) -> Option<&BpfProgram> {
        self.program.as_ref()
    }

    /// Custom profiles list one syscall name per line; `#` starts a comment.
    fn load_profile(&self, ctx: &ModuleCtx, path: &Path) -> Result<Vec<String>> {
        let content = ctx
            .sys
            .read_file(path)
            .map_err(|e| SandboxError::Security(format!("seccomp profile: {}", e)))?;

        let names: Vec<String> = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect();

        if names.is_empty() {
            return Err(SandboxError::Security(format!(
                "seccomp profile {} lists no syscalls",
                path.display()
            )));
        }

        log::info!("loaded seccomp profile with {} syscalls", names.len());
        Ok(names)
    }

    fn compile(&self, allowlist: &[String], mismatch: SeccompAction) -> Result<BpfProgram> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        let mut resolved = 0usize;

        for name in allowlist {
            match resolve_syscall(name) {
                // Empty rule vector matches the syscall unconditionally.
                Some(nr) => {
                    rules.insert(nr, vec![]);
                    resolved += 1;
                }
                None => log::warn!("skipping unresolvable syscall in allow-list: {}", name),
            }
        }

        if rules.is_empty() {
            return Err(SandboxError::Security(
                "seccomp allow-list resolved to no syscalls".to_string(),
            ));
        }

        let filter = SeccompFilter::new(rules, mismatch, SeccompAction::Allow, target_arch()?)
            .map_err(|e| SandboxError::Security(format!("build seccomp filter: {}", e)))?;
        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| SandboxError::Security(format!("compile seccomp filter: {}", e)))?;

        log::debug!(
            "compiled seccomp filter: {} allowed syscalls, {} instructions",
            resolved,
            program.len()
        );
        Ok(program)
    }
}

impl Default for SeccompModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SeccompModule {
    fn name(&self) -> &'static str {
        "seccomp"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Security
    }

    fn description(&self) -> &'static str {
        "seccomp-bpf filtering restricting the syscalls available to the sandbox"
    }

    fn dependencies(&self) -> &[&'static str] {
        &["mounts"]
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn is_enabled(&self, config: &SandboxConfiguration) -> bool {
        SeccompPolicy::parse(&config.security.seccomp_policy) != Some(SeccompPolicy::Off)
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        self.policy = SeccompPolicy::parse(&ctx.config.security.seccomp_policy)
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "unknown seccomp policy: {}",
                    ctx.config.security.seccomp_policy
                ))
            })?;

        if self.policy == SeccompPolicy::Off {
            log::info!("seccomp disabled by policy");
            self.state = ModuleState::Initialized;
            return Ok(());
        }

        if let Some(mismatch) = self.policy.mismatch_action() {
            let profile_path = &ctx.config.security.seccomp_profile_path;
            let allowlist: Vec<String> = if profile_path.is_empty() {
                DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect()
            } else {
                self.load_profile(ctx, Path::new(profile_path))?
            };
            self.program = Some(self.compile(&allowlist, mismatch)?);
        } else {
            log::info!("seccomp policy allows all syscalls; no filter compiled");
        }

        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&self, ctx: &ModuleCtx) -> Result<()> {
        if self.policy == SeccompPolicy::Off {
            return Ok(());
        }

        // Without this bit PR_SET_SECCOMP fails for non-privileged callers
        // and the filter would not survive execve.
        ctx.sys
            .set_no_new_privs()
            .map_err(|e| SandboxError::Security(format!("no_new_privs: {}", e)))?;

        if let Some(program) = &self.program {
            ctx.sys
                .apply_seccomp(program)
                .map_err(|e| SandboxError::Security(format!("install filter: {}", e)))?;
            log::debug!("seccomp filter installed");
        }

        Ok(())
    }

    fn cleanup(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        self.program = None;
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::syscall::{FakeSys, SysOp};

    fn ctx<'a>(config: &'a SandboxConfiguration, sys: &'a FakeSys) -> ModuleCtx<'a> {
        ModuleCtx::new(config, sys)
    }

    fn config_with_policy(policy: &str) -> SandboxConfiguration {
        let mut config = SandboxConfiguration::default();
        config.security.seccomp_policy = policy.to_string();
        config
    }

    #[test]
    fn policy_parsing_covers_all_selectors() {
        assert_eq!(SeccompPolicy::parse("default"), Some(SeccompPolicy::Default));
        assert_eq!(SeccompPolicy::parse("strict"), Some(SeccompPolicy::Strict));
        assert_eq!(SeccompPolicy::parse("log"), Some(SeccompPolicy::Log));
        assert_eq!(SeccompPolicy::parse("allow"), Some(SeccompPolicy::Allow));
        assert_eq!(SeccompPolicy::parse("off"), Some(SeccompPolicy::Off));
        assert_eq!(SeccompPolicy::parse("bogus"), None);
    }

    #[test]
    fn default_policy_compiles_a_filter() {
        let config = config_with_policy("default");
        let sys = FakeSys::new();
        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.program().is_some());
        assert!(!module.program().unwrap().is_empty());
    }

    #[test]
    fn filter_compilation_is_deterministic() {
        let config = config_with_policy("default");
        let sys = FakeSys::new();

        let mut first = SeccompModule::new();
        first.initialize(&ctx(&config, &sys)).unwrap();
        let mut second = SeccompModule::new();
        second.initialize(&ctx(&config, &sys)).unwrap();

        assert_eq!(
            first.program().unwrap().len(),
            second.program().unwrap().len()
        );
    }

    #[test]
    fn allow_policy_compiles_no_filter_but_still_sets_no_new_privs() {
        let config = config_with_policy("allow");
        let sys = FakeSys::new();
        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.program().is_none());

        module.apply_child(&ctx(&config, &sys)).unwrap();
        assert_eq!(sys.ops(), vec![SysOp::SetNoNewPrivs]);
    }

    #[test]
    fn off_policy_disables_the_module() {
        let config = config_with_policy("off");
        let sys = FakeSys::new();
        let module = SeccompModule::new();
        assert!(!module.is_enabled(&config));

        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();
        assert!(sys.ops().is_empty());
    }

    #[test]
    fn no_new_privs_precedes_filter_install() {
        let config = config_with_policy("default");
        let sys = FakeSys::new();
        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        module.apply_child(&ctx(&config, &sys)).unwrap();

        assert_eq!(sys.ops(), vec![SysOp::SetNoNewPrivs, SysOp::ApplySeccomp]);
    }

    #[test]
    fn no_new_privs_failure_is_a_security_error() {
        let config = config_with_policy("default");
        let sys = FakeSys::new();
        sys.fail_matching("set_no_new_privs");
        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();

        let err = module.apply_child(&ctx(&config, &sys)).unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
        // The filter must not be installed after the prerequisite failed.
        assert!(!sys.ops().contains(&SysOp::ApplySeccomp));
    }

    #[test]
    fn unresolvable_names_are_skipped() {
        assert_eq!(resolve_syscall("read"), Some(libc::SYS_read));
        assert_eq!(resolve_syscall("not_a_syscall"), None);

        let module = SeccompModule::new();
        let allowlist = vec!["read".to_string(), "frobnicate".to_string()];
        let program = module
            .compile(&allowlist, SeccompAction::Errno(libc::EPERM as u32))
            .unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn custom_profile_parses_names_and_comments() {
        let mut config = config_with_policy("default");
        config.security.seccomp_profile_path = "/etc/sandbox/profile".to_string();

        let sys = FakeSys::new();
        sys.add_file(
            "/etc/sandbox/profile",
            "# minimal profile\nread\nwrite # needed for output\nexit_group\n\n",
        );

        let mut module = SeccompModule::new();
        module.initialize(&ctx(&config, &sys)).unwrap();
        assert!(module.program().is_some());
    }

    #[test]
    fn missing_profile_is_a_security_error() {
        let mut config = config_with_policy("default");
        config.security.seccomp_profile_path = "/etc/sandbox/absent".to_string();

        let sys = FakeSys::new();
        let mut module = SeccompModule::new();
        let err = module.initialize(&ctx(&config, &sys)).unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn default_allowlist_resolves_fully_on_this_target() {
        for name in DEFAULT_ALLOWLIST {
            assert!(
                resolve_syscall(name).is_some(),
                "allow-list entry {} did not resolve",
                name
            );
        }
    }

    #[test]
    fn module_identity() {
        let module = SeccompModule::new();
        assert_eq!(module.name(), "seccomp");
        assert_eq!(module.dependencies(), &["mounts"]);
        assert_eq!(module.module_type(), ModuleType::Security);
    }
}
