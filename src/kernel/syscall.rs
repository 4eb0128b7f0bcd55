//! Syscall layer: named, side-effect-only operations with explicit error
//! reporting.
//!
//! Every module goes through the [`Sys`] trait instead of calling the kernel
//! directly, so engine and module behaviour can be asserted as an operation
//! trace against the in-memory [`FakeSys`]. [`RealSys`] is the production
//! implementation. The layer performs no policy.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use caps::{CapSet, Capability, CapsHashSet};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use seccompiler::BpfProgram;

/// Error from a single syscall-layer operation. Carries the `errno` when the
/// kernel reported one so callers can surface it verbatim.
#[derive(Debug)]
pub struct SysError {
    pub op: &'static str,
    pub detail: String,
    pub errno: Option<Errno>,
}

impl SysError {
    pub fn new(op: &'static str, detail: impl Into<String>, errno: Errno) -> Self {
        Self {
            op,
            detail: detail.into(),
            errno: Some(errno),
        }
    }

    pub fn without_errno(op: &'static str, detail: impl Into<String>) -> Self {
        Self {
            op,
            detail: detail.into(),
            errno: None,
        }
    }

    pub fn from_io(op: &'static str, detail: impl Into<String>, err: &std::io::Error) -> Self {
        Self {
            op,
            detail: detail.into(),
            errno: err.raw_os_error().map(Errno::from_i32),
        }
    }

    /// True when the kernel reported the target as busy (EBUSY).
    pub fn is_busy(&self) -> bool {
        self.errno == Some(Errno::EBUSY)
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(
                f,
                "{} {}: {} ({})",
                self.op,
                self.detail,
                errno.desc(),
                errno as i32
            ),
            None => write!(f, "{} {}", self.op, self.detail),
        }
    }
}

impl std::error::Error for SysError {}

pub type SysResult<T> = std::result::Result<T, SysError>;

/// Named operations the sandbox relies on. One production implementation
/// ([`RealSys`]) and one recording fake ([`FakeSys`]).
pub trait Sys: Send + Sync {
    fn read_file(&self, path: &Path) -> SysResult<String>;

    /// Writes exactly the given bytes. The file is created only if the parent
    /// directory exists; no trailing newline is appended.
    fn write_file(&self, path: &Path, contents: &str) -> SysResult<()>;

    fn mkdir_all(&self, path: &Path) -> SysResult<()>;
    fn remove_dir(&self, path: &Path) -> SysResult<()>;
    fn remove_all(&self, path: &Path) -> SysResult<()>;
    fn exists(&self, path: &Path) -> bool;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> SysResult<()>;

    fn umount2(&self, target: &Path, flags: MntFlags) -> SysResult<()>;
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> SysResult<()>;
    fn chdir(&self, path: &Path) -> SysResult<()>;
    fn sethostname(&self, name: &str) -> SysResult<()>;

    /// `prctl(PR_SET_NO_NEW_PRIVS, 1)`. Prerequisite for installing a seccomp
    /// filter without CAP_SYS_ADMIN.
    fn set_no_new_privs(&self) -> SysResult<()>;

    /// `prctl(PR_SET_NAME, ...)` for the calling process.
    fn set_process_name(&self, name: &str) -> SysResult<()>;

    /// Installs a compiled seccomp-bpf program on the calling thread.
    /// Irreversible within the process.
    fn apply_seccomp(&self, program: &BpfProgram) -> SysResult<()>;

    /// Clears the effective set, shrinks permitted to `keep`, then raises
    /// effective and inheritable to `keep`.
    fn cap_set_proc(&self, keep: &CapsHashSet) -> SysResult<()>;

    fn cap_raise_ambient(&self, cap: Capability) -> SysResult<()>;
    fn cap_drop_bounding(&self, cap: Capability) -> SysResult<()>;
}

// ============================================================================
// Production implementation
// ============================================================================

/// Production syscall layer backed by nix/libc and the seccomp and capability
/// libraries.
#[derive(Debug, Default)]
pub struct RealSys;

impl RealSys {
    pub fn new() -> Self {
        Self
    }
}

fn caps_err(op: &'static str, detail: String, err: caps::errors::CapsError) -> SysError {
    SysError::without_errno(op, format!("{}: {}", detail, err))
}

impl Sys for RealSys {
    fn read_file(&self, path: &Path) -> SysResult<String> {
        std::fs::read_to_string(path)
            .map_err(|e| SysError::from_io("read_file", path.display().to_string(), &e))
    }

    fn write_file(&self, path: &Path, contents: &str) -> SysResult<()> {
        std::fs::write(path, contents)
            .map_err(|e| SysError::from_io("write_file", path.display().to_string(), &e))
    }

    fn mkdir_all(&self, path: &Path) -> SysResult<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| SysError::from_io("mkdir_all", path.display().to_string(), &e))
    }

    fn remove_dir(&self, path: &Path) -> SysResult<()> {
        std::fs::remove_dir(path)
            .map_err(|e| SysError::from_io("remove_dir", path.display().to_string(), &e))
    }

    fn remove_all(&self, path: &Path) -> SysResult<()> {
        std::fs::remove_dir_all(path)
            .map_err(|e| SysError::from_io("remove_all", path.display().to_string(), &e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> SysResult<()> {
        nix::mount::mount(source, target, fstype, flags, data)
            .map_err(|e| SysError::new("mount", target.display().to_string(), e))
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> SysResult<()> {
        nix::mount::umount2(target, flags)
            .map_err(|e| SysError::new("umount2", target.display().to_string(), e))
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> SysResult<()> {
        nix::unistd::pivot_root(new_root, put_old)
            .map_err(|e| SysError::new("pivot_root", new_root.display().to_string(), e))
    }

    fn chdir(&self, path: &Path) -> SysResult<()> {
        nix::unistd::chdir(path).map_err(|e| SysError::new("chdir", path.display().to_string(), e))
    }

    fn sethostname(&self, name: &str) -> SysResult<()> {
        nix::unistd::sethostname(name).map_err(|e| SysError::new("sethostname", name, e))
    }

    fn set_no_new_privs(&self) -> SysResult<()> {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(SysError::new("prctl", "PR_SET_NO_NEW_PRIVS", Errno::last()));
        }
        Ok(())
    }

    fn set_process_name(&self, name: &str) -> SysResult<()> {
        // PR_SET_NAME truncates to 15 bytes plus NUL in the kernel.
        let cname = CString::new(name.as_bytes())
            .map_err(|_| SysError::without_errno("prctl", "process name contains NUL byte"))?;
        let rc = unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr(), 0, 0, 0) };
        if rc != 0 {
            return Err(SysError::new("prctl", "PR_SET_NAME", Errno::last()));
        }
        Ok(())
    }

    fn apply_seccomp(&self, program: &BpfProgram) -> SysResult<()> {
        seccompiler::apply_filter(program)
            .map_err(|e| SysError::without_errno("seccomp", format!("apply_filter: {}", e)))
    }

    fn cap_set_proc(&self, keep: &CapsHashSet) -> SysResult<()> {
        // Drop the effective set first so shrinking permitted is legal, then
        // raise effective/inheritable from within the new permitted set.
        caps::set(None, CapSet::Effective, &CapsHashSet::new())
            .map_err(|e| caps_err("cap_set_proc", "clear effective".into(), e))?;
        caps::set(None, CapSet::Permitted, keep)
            .map_err(|e| caps_err("cap_set_proc", "set permitted".into(), e))?;
        caps::set(None, CapSet::Effective, keep)
            .map_err(|e| caps_err("cap_set_proc", "set effective".into(), e))?;
        caps::set(None, CapSet::Inheritable, keep)
            .map_err(|e| caps_err("cap_set_proc", "set inheritable".into(), e))?;
        Ok(())
    }

    fn cap_raise_ambient(&self, cap: Capability) -> SysResult<()> {
        caps::raise(None, CapSet::Ambient, cap)
            .map_err(|e| caps_err("cap_raise_ambient", cap.to_string(), e))
    }

    fn cap_drop_bounding(&self, cap: Capability) -> SysResult<()> {
        caps::drop(None, CapSet::Bounding, cap)
            .map_err(|e| caps_err("cap_drop_bounding", cap.to_string(), e))
    }
}

// ============================================================================
// Recording fake
// ============================================================================

/// One recorded syscall-layer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysOp {
    ReadFile {
        path: PathBuf,
    },
    WriteFile {
        path: PathBuf,
        contents: String,
    },
    MkdirAll {
        path: PathBuf,
    },
    RemoveDir {
        path: PathBuf,
    },
    RemoveAll {
        path: PathBuf,
    },
    Mount {
        source: String,
        target: PathBuf,
        fstype: String,
        flags: MsFlags,
        data: String,
    },
    Umount2 {
        target: PathBuf,
        flags: MntFlags,
    },
    PivotRoot {
        new_root: PathBuf,
        put_old: PathBuf,
    },
    Chdir {
        path: PathBuf,
    },
    Sethostname {
        name: String,
    },
    SetNoNewPrivs,
    SetProcessName {
        name: String,
    },
    ApplySeccomp,
    CapSetProc {
        keep: Vec<String>,
    },
    CapRaiseAmbient {
        cap: String,
    },
    CapDropBounding {
        cap: String,
    },
}

impl SysOp {
    /// Short textual form used for failure injection and assertions.
    pub fn describe(&self) -> String {
        match self {
            SysOp::ReadFile { path } => format!("read_file {}", path.display()),
            SysOp::WriteFile { path, .. } => format!("write_file {}", path.display()),
            SysOp::MkdirAll { path } => format!("mkdir_all {}", path.display()),
            SysOp::RemoveDir { path } => format!("remove_dir {}", path.display()),
            SysOp::RemoveAll { path } => format!("remove_all {}", path.display()),
            SysOp::Mount { source, target, .. } => {
                format!("mount {} {}", source, target.display())
            }
            SysOp::Umount2 { target, .. } => format!("umount2 {}", target.display()),
            SysOp::PivotRoot { new_root, .. } => format!("pivot_root {}", new_root.display()),
            SysOp::Chdir { path } => format!("chdir {}", path.display()),
            SysOp::Sethostname { name } => format!("sethostname {}", name),
            SysOp::SetNoNewPrivs => "set_no_new_privs".to_string(),
            SysOp::SetProcessName { name } => format!("set_process_name {}", name),
            SysOp::ApplySeccomp => "apply_seccomp".to_string(),
            SysOp::CapSetProc { .. } => "cap_set_proc".to_string(),
            SysOp::CapRaiseAmbient { cap } => format!("cap_raise_ambient {}", cap),
            SysOp::CapDropBounding { cap } => format!("cap_drop_bounding {}", cap),
        }
    }
}

/// In-memory syscall layer that records every operation and can be primed to
/// fail specific ones. Used by unit and scenario tests.
#[derive(Default)]
pub struct FakeSys {
    ops: Mutex<Vec<SysOp>>,
    paths: Mutex<HashSet<PathBuf>>,
    files: Mutex<HashMap<PathBuf, String>>,
    fail_patterns: Mutex<Vec<String>>,
}

impl FakeSys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a path as existing for `exists()` checks.
    pub fn add_path(&self, path: impl Into<PathBuf>) {
        self.paths.lock().unwrap().insert(path.into());
    }

    /// Seeds file contents for `read_file` and marks the path as existing.
    pub fn add_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        let path = path.into();
        self.paths.lock().unwrap().insert(path.clone());
        self.files.lock().unwrap().insert(path, contents.into());
    }

    /// Any operation whose `describe()` output contains `pattern` fails with
    /// EPERM.
    pub fn fail_matching(&self, pattern: impl Into<String>) {
        self.fail_patterns.lock().unwrap().push(pattern.into());
    }

    /// Snapshot of the recorded operation trace.
    pub fn ops(&self) -> Vec<SysOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Contents of every `write_file` whose path contains `path_fragment`,
    /// in order.
    pub fn writes_to(&self, path_fragment: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SysOp::WriteFile { path, contents }
                    if path.to_string_lossy().contains(path_fragment) =>
                {
                    Some(contents)
                }
                _ => None,
            })
            .collect()
    }

    /// Asserts `needles` appear in the trace in order (not necessarily
    /// adjacent). Panics with the full trace on mismatch.
    pub fn assert_subsequence(&self, needles: &[&str]) {
        let descriptions: Vec<String> = self.ops().iter().map(|op| op.describe()).collect();
        let mut pos = 0;
        for needle in needles {
            match descriptions[pos..]
                .iter()
                .position(|d| d.contains(needle))
            {
                Some(offset) => pos += offset + 1,
                None => panic!(
                    "operation {:?} not found (in order) in trace: {:#?}",
                    needle, descriptions
                ),
            }
        }
    }

    fn record(&self, op: SysOp, failed_op: &'static str) -> SysResult<()> {
        let description = op.describe();
        self.ops.lock().unwrap().push(op);
        let patterns = self.fail_patterns.lock().unwrap();
        if patterns.iter().any(|p| description.contains(p.as_str())) {
            return Err(SysError::new(failed_op, description, Errno::EPERM));
        }
        Ok(())
    }
}

impl Sys for FakeSys {
    fn read_file(&self, path: &Path) -> SysResult<String> {
        self.record(
            SysOp::ReadFile {
                path: path.to_path_buf(),
            },
            "read_file",
        )?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                SysError::new("read_file", path.display().to_string(), Errno::ENOENT)
            })
    }

    fn write_file(&self, path: &Path, contents: &str) -> SysResult<()> {
        self.record(
            SysOp::WriteFile {
                path: path.to_path_buf(),
                contents: contents.to_string(),
            },
            "write_file",
        )?;
        self.paths.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> SysResult<()> {
        self.record(
            SysOp::MkdirAll {
                path: path.to_path_buf(),
            },
            "mkdir_all",
        )?;
        self.paths.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> SysResult<()> {
        self.record(
            SysOp::RemoveDir {
                path: path.to_path_buf(),
            },
            "remove_dir",
        )?;
        self.paths.lock().unwrap().remove(path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> SysResult<()> {
        self.record(
            SysOp::RemoveAll {
                path: path.to_path_buf(),
            },
            "remove_all",
        )?;
        self.paths.lock().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.paths.lock().unwrap().contains(path)
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> SysResult<()> {
        self.record(
            SysOp::Mount {
                source: source.map(|p| p.display().to_string()).unwrap_or_default(),
                target: target.to_path_buf(),
                fstype: fstype.unwrap_or_default().to_string(),
                flags,
                data: data.unwrap_or_default().to_string(),
            },
            "mount",
        )
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> SysResult<()> {
        self.record(
            SysOp::Umount2 {
                target: target.to_path_buf(),
                flags,
            },
            "umount2",
        )
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> SysResult<()> {
        self.record(
            SysOp::PivotRoot {
                new_root: new_root.to_path_buf(),
                put_old: put_old.to_path_buf(),
            },
            "pivot_root",
        )
    }

    fn chdir(&self, path: &Path) -> SysResult<()> {
        self.record(
            SysOp::Chdir {
                path: path.to_path_buf(),
            },
            "chdir",
        )
    }

    fn sethostname(&self, name: &str) -> SysResult<()> {
        self.record(
            SysOp::Sethostname {
                name: name.to_string(),
            },
            "sethostname",
        )
    }

    fn set_no_new_privs(&self) -> SysResult<()> {
        self.record(SysOp::SetNoNewPrivs, "prctl")
    }

    fn set_process_name(&self, name: &str) -> SysResult<()> {
        self.record(
            SysOp::SetProcessName {
                name: name.to_string(),
            },
            "prctl",
        )
    }

    fn apply_seccomp(&self, _program: &BpfProgram) -> SysResult<()> {
        self.record(SysOp::ApplySeccomp, "seccomp")
    }

    fn cap_set_proc(&self, keep: &CapsHashSet) -> SysResult<()> {
        let mut names: Vec<String> = keep.iter().map(|c| c.to_string()).collect();
        names.sort();
        self.record(SysOp::CapSetProc { keep: names }, "cap_set_proc")
    }

    fn cap_raise_ambient(&self, cap: Capability) -> SysResult<()> {
        self.record(
            SysOp::CapRaiseAmbient {
                cap: cap.to_string(),
            },
            "cap_raise_ambient",
        )
    }

    fn cap_drop_bounding(&self, cap: Capability) -> SysResult<()> {
        self.record(
            SysOp::CapDropBounding {
                cap: cap.to_string(),
            },
            "cap_drop_bounding",
        )
    }
}
