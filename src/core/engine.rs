//! The sandbox lifecycle engine.
//!
//! One engine instance supervises one sandboxed process tree: it orders the
//! registered modules by dependency, runs their parent-side phases, clones
//! the child into the requested namespaces, supervises it, and tears
//! everything down on every exit path.
//!
//! The child is attached to its cgroup before it runs anything privileged:
//! it blocks on a one-byte read from a sync pipe until the parent has
//! finished every `prepare_child` hook.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, pipe, read, write, Pid};

use crate::config::types::SandboxConfiguration;
use crate::core::types::{SandboxResult, SandboxState};
use crate::error::{Result, SandboxError};
use crate::kernel::syscall::{RealSys, Sys};
use crate::module::{Module, ModuleCtx};
use crate::modules;

const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable handle for stopping a running sandbox from another thread.
#[derive(Clone)]
pub struct SandboxHandle {
    child_pid: Arc<AtomicI32>,
}

impl SandboxHandle {
    /// Sends SIGTERM, polls for exit at 100 ms cadence, and SIGKILLs when
    /// the timeout expires. Idempotent; returns true once the child is gone.
    pub fn stop(&self, timeout_ms: u64) -> bool {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return true;
        }
        let pid = Pid::from_raw(pid);

        log::info!("stopping sandbox child {} (timeout {} ms)", pid, timeout_ms);
        let _ = kill(pid, Signal::SIGTERM);

        let attempts = (timeout_ms / 100).max(1);
        for _ in 0..attempts {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => thread::sleep(STOP_POLL_INTERVAL),
                // Exited, or already reaped by the supervising thread.
                Ok(_) | Err(Errno::ECHILD) => return true,
                Err(Errno::EINTR) => continue,
                Err(_) => return true,
            }
        }

        log::warn!("graceful shutdown timed out, sending SIGKILL");
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        true
    }
}

/// Handle to a sandbox run scheduled on a background thread.
pub struct AsyncSandbox {
    handle: SandboxHandle,
    thread: thread::JoinHandle<SandboxResult>,
}

impl AsyncSandbox {
    pub fn handle(&self) -> SandboxHandle {
        self.handle.clone()
    }

    pub fn stop(&self, timeout_ms: u64) -> bool {
        self.handle.stop(timeout_ms)
    }

    /// Blocks until the run finishes and yields its result.
    pub fn join(self) -> SandboxResult {
        self.thread
            .join()
            .unwrap_or_else(|_| SandboxResult::failure("sandbox thread panicked"))
    }
}

/// Orchestrates module lifecycles around one sandboxed child process.
pub struct SandboxEngine {
    config: SandboxConfiguration,
    sys: Arc<dyn Sys>,
    modules: Vec<Box<dyn Module>>,
    order: Vec<usize>,
    state: SandboxState,
    child_pid: Arc<AtomicI32>,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfiguration) -> Self {
        Self::with_sys(config, Arc::new(RealSys::new()))
    }

    /// Builds an engine over a custom syscall layer (tests use the fake).
    pub fn with_sys(config: SandboxConfiguration, sys: Arc<dyn Sys>) -> Self {
        Self {
            config,
            sys,
            modules: Vec::new(),
            order: Vec::new(),
            state: SandboxState::Created,
            child_pid: Arc::new(AtomicI32::new(-1)),
        }
    }

    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            child_pid: Arc::clone(&self.child_pid),
        }
    }

    /// Registers a module. A module with the same name replaces the previous
    /// registration (with a warning).
    pub fn register_module(&mut self, module: Box<dyn Module>) {
        if let Some(existing) = self
            .modules
            .iter()
            .position(|m| m.name() == module.name())
        {
            log::warn!("module {} already registered, replacing", module.name());
            self.modules[existing] = module;
            return;
        }
        log::info!("registered module: {}", module.name());
        self.modules.push(module);
    }

    /// Registers the built-in isolation modules in their canonical order.
    pub fn register_default_modules(&mut self) {
        self.register_module(Box::new(modules::NamespacesModule::new()));
        self.register_module(Box::new(modules::CgroupsModule::new()));
        self.register_module(Box::new(modules::RootFsModule::new()));
        self.register_module(Box::new(modules::MountsModule::new()));
        self.register_module(Box::new(modules::SeccompModule::new()));
        self.register_module(Box::new(modules::CapsModule::new()));
    }

    /// Names of the modules in resolved execution order (resolves first if
    /// needed).
    pub fn execution_order(&mut self) -> Vec<&'static str> {
        if self.order.is_empty() {
            self.order = resolve_order(&self.modules);
        }
        self.order
            .iter()
            .map(|&idx| self.modules[idx].name())
            .collect()
    }

    /// Runs the sandbox to completion. Exactly one result per engine.
    pub fn run(&mut self) -> SandboxResult {
        let started = Instant::now();

        if self.state != SandboxState::Created {
            return SandboxResult::failure("sandbox engine can only run once");
        }

        log::info!("starting sandbox: {}", self.config.sandbox.name);
        self.state = SandboxState::Initializing;
        self.order = resolve_order(&self.modules);

        // Parent-side initialize, forward order. A failure means the child
        // is never forked; modules that had side effects are unwound.
        for pos in 0..self.order.len() {
            let idx = self.order[pos];
            let ctx = ModuleCtx::new(&self.config, self.sys.as_ref());
            if !self.modules[idx].is_enabled(&self.config) {
                continue;
            }
            log::info!("initializing module: {}", self.modules[idx].name());
            if let Err(e) = self.modules[idx].initialize(&ctx) {
                let message = format!(
                    "failed to initialize module {}: {}",
                    self.modules[idx].name(),
                    e
                );
                log::error!("{}", message);
                self.cleanup_modules(pos);
                self.state = SandboxState::Error;
                let mut result = SandboxResult::failure(message);
                result.duration = started.elapsed();
                return result;
            }
        }

        // Capture pipe for the child's stdout/stderr, sync pipe for the
        // cgroup-attach handshake.
        let (out_read, out_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => return self.fail_before_fork(started, format!("pipe: {}", e)),
        };
        let (sync_read, sync_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                let _ = close(out_read);
                let _ = close(out_write);
                return self.fail_before_fork(started, format!("pipe: {}", e));
            }
        };

        let flags = modules::namespaces::clone_flags(&self.config.isolation);
        log::info!("cloning child with namespace flags {:?}", flags);

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child = {
            let this: &SandboxEngine = self;
            let cb =
                Box::new(move || this.child_entry(sync_read, sync_write, out_read, out_write));
            match unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) } {
                Ok(pid) => pid,
                Err(e) => {
                    let _ = close(out_read);
                    let _ = close(out_write);
                    let _ = close(sync_read);
                    let _ = close(sync_write);
                    return self
                        .fail_before_fork(started, format!("clone failed: {}", e));
                }
            }
        };

        self.child_pid.store(child.as_raw(), Ordering::SeqCst);
        log::info!("child process started with pid {}", child);
        let _ = close(sync_read);
        let _ = close(out_write);

        // Parent-side prepare while the child blocks on the sync pipe. The
        // cgroup attach happens here, so the child is a member before it
        // executes anything.
        self.state = SandboxState::Preparing;
        let mut prepare_error: Option<String> = None;
        for pos in 0..self.order.len() {
            let idx = self.order[pos];
            let ctx = ModuleCtx::new(&self.config, self.sys.as_ref());
            if !self.modules[idx].is_enabled(&self.config) {
                continue;
            }
            if let Err(e) = self.modules[idx].prepare_child(&ctx, child) {
                prepare_error = Some(format!(
                    "failed to prepare module {}: {}",
                    self.modules[idx].name(),
                    e
                ));
                break;
            }
        }

        if let Some(message) = prepare_error {
            log::error!("{}", message);
            let _ = kill(child, Signal::SIGKILL);
            let _ = close(sync_write);
            let _ = close(out_read);
            let _ = waitpid(child, None);
            self.finish(SandboxState::Error);
            let mut result = SandboxResult::failure(message);
            result.child_pid = child.as_raw();
            result.duration = started.elapsed();
            return result;
        }

        // Unblock the child. A write error means the child already died;
        // waitpid below reports it.
        let _ = write(sync_write, b"x");
        let _ = close(sync_write);

        self.state = SandboxState::Running;

        // Drain the capture pipe concurrently so a chatty child cannot
        // deadlock against a full pipe buffer.
        let drain = thread::spawn(move || {
            let mut file = unsafe { File::from_raw_fd(out_read) };
            let mut buf = Vec::new();
            let _ = file.read_to_end(&mut buf);
            buf
        });

        let status = loop {
            match waitpid(child, None) {
                Ok(status) => break Ok(status),
                Err(Errno::EINTR) => continue,
                Err(e) => break Err(e),
            }
        };

        let stdout_bytes = drain.join().unwrap_or_default();

        let mut result = SandboxResult {
            exit_code: -1,
            success: false,
            error_message: None,
            duration: Duration::ZERO,
            stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
            child_pid: child.as_raw(),
        };

        match status {
            Ok(WaitStatus::Exited(_, code)) => {
                result.exit_code = code;
                result.success = code == 0;
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                result.exit_code = -(signal as i32);
                result.success = false;
                result.error_message = Some(format!("killed by signal: {}", signal));
            }
            Ok(other) => {
                result.error_message = Some(format!("unexpected wait status: {:?}", other));
            }
            Err(e) => {
                result.error_message = Some(format!("waitpid failed: {}", e));
            }
        }

        self.finish(SandboxState::Stopped);
        result.duration = started.elapsed();

        log::info!(
            "sandbox finished in {} ms with exit code {}",
            result.duration.as_millis(),
            result.exit_code
        );
        result
    }

    /// Schedules `run` on a worker thread and returns immediately.
    pub fn run_async(mut self) -> AsyncSandbox {
        let handle = self.handle();
        let thread = thread::spawn(move || self.run());
        AsyncSandbox { handle, thread }
    }

    /// Child-side path: block until prepared, redirect output, apply modules
    /// in forward order, then exec the user command.
    fn child_entry(
        &self,
        sync_read: RawFd,
        sync_write: RawFd,
        out_read: RawFd,
        out_write: RawFd,
    ) -> isize {
        let _ = close(sync_write);
        let _ = close(out_read);

        // Wait for the parent to finish prepare_child (cgroup attach). EOF
        // means the parent gave up.
        let mut byte = [0u8; 1];
        loop {
            match read(sync_read, &mut byte) {
                Ok(1) => break,
                Err(Errno::EINTR) => continue,
                _ => return 1,
            }
        }
        let _ = close(sync_read);

        if let Err(e) = self.sys.set_process_name(&self.config.sandbox.name) {
            log::warn!("failed to set process title: {}", e);
        }

        // One shared pipe for stdout and stderr.
        let _ = dup2(out_write, libc::STDOUT_FILENO);
        let _ = dup2(out_write, libc::STDERR_FILENO);
        let _ = close(out_write);

        let ctx = ModuleCtx::new(&self.config, self.sys.as_ref());
        for &idx in &self.order {
            let module = &self.modules[idx];
            if !module.is_enabled(&self.config) {
                continue;
            }
            if let Err(e) = module.apply_child(&ctx) {
                log::error!("module {} failed in child: {}", module.name(), e);
                return 1;
            }
        }

        for &idx in &self.order {
            let module = &self.modules[idx];
            if !module.is_enabled(&self.config) {
                continue;
            }
            match module.execute(&ctx) {
                Ok(_) => {}
                Err(e) => {
                    log::error!("module {} execute failed: {}", module.name(), e);
                    return 1;
                }
            }
        }

        match self.exec_command() {
            Ok(code) => code,
            Err(e) => {
                log::error!("failed to execute command: {}", e);
                127
            }
        }
    }

    /// Replaces the child image with the configured command.
    fn exec_command(&self) -> Result<isize> {
        let command = &self.config.sandbox.command;
        let mut argv = Vec::with_capacity(command.len());
        for arg in command {
            argv.push(CString::new(arg.as_str()).map_err(|_| {
                SandboxError::Child("command contains NUL byte".to_string())
            })?);
        }
        let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|a| a.as_c_str()).collect();

        execvp(argv[0].as_c_str(), &argv_refs)
            .map_err(|e| SandboxError::Child(format!("execvp {}: {}", command[0], e)))?;
        unreachable!("execvp returned without error");
    }

    /// Cleans up modules `order[..=upto]` in reverse forward order. Errors
    /// are logged; every module is still attempted.
    fn cleanup_modules(&mut self, upto: usize) {
        if self.order.is_empty() {
            return;
        }
        let upto = upto.min(self.order.len() - 1);
        for pos in (0..=upto).rev() {
            let idx = self.order[pos];
            let ctx = ModuleCtx::new(&self.config, self.sys.as_ref());
            if !self.modules[idx].is_enabled(&self.config) {
                continue;
            }
            log::info!("cleaning up module: {}", self.modules[idx].name());
            if let Err(e) = self.modules[idx].cleanup(&ctx) {
                log::error!(
                    "failed to clean up module {}: {}",
                    self.modules[idx].name(),
                    e
                );
            }
        }
    }

    fn finish(&mut self, terminal: SandboxState) {
        self.state = SandboxState::Stopping;
        let last = self.order.len().saturating_sub(1);
        self.cleanup_modules(last);
        self.child_pid.store(-1, Ordering::SeqCst);
        self.state = terminal;
    }

    fn fail_before_fork(&mut self, started: Instant, message: String) -> SandboxResult {
        log::error!("{}", message);
        self.finish(SandboxState::Error);
        let mut result = SandboxResult::failure(message);
        result.duration = started.elapsed();
        result
    }
}

/// Depth-first topological sort over declared dependencies, stable with
/// respect to registration order. A dependency cycle is logged and broken by
/// emitting the revisited module after its dependents.
fn resolve_order(modules: &[Box<dyn Module>]) -> Vec<usize> {
    let index: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name(), i))
        .collect();

    fn visit(
        name: &str,
        modules: &[Box<dyn Module>],
        index: &HashMap<&str, usize>,
        visited: &mut HashSet<usize>,
        temp: &mut HashSet<usize>,
        order: &mut Vec<usize>,
    ) {
        let Some(&idx) = index.get(name) else {
            log::warn!("module not found for dependency resolution: {}", name);
            return;
        };
        if temp.contains(&idx) {
            log::warn!("circular dependency detected at module: {}", name);
            return;
        }
        if visited.contains(&idx) {
            return;
        }

        temp.insert(idx);
        for dep in modules[idx].dependencies() {
            visit(dep, modules, index, visited, temp, order);
        }
        temp.remove(&idx);
        visited.insert(idx);
        order.push(idx);
    }

    let mut visited = HashSet::new();
    let mut temp = HashSet::new();
    let mut order = Vec::with_capacity(modules.len());
    for module in modules {
        visit(
            module.name(),
            modules,
            &index,
            &mut visited,
            &mut temp,
            &mut order,
        );
    }

    log::debug!("resolved execution order for {} modules", order.len());
    order
}
