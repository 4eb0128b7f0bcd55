//! Error types for sandbox operations.

use thiserror::Error;

/// Errors raised while building, running, or tearing down a sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Invalid or missing configuration. Raised before any side effects.
    #[error("configuration error: {0}")]
    Config(String),

    /// A cgroup, file, or mount operation against the kernel failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// clone/unshare or user-namespace map setup failed.
    #[error("namespace error: {0}")]
    Namespace(String),

    /// Seccomp install or capability restriction failed. The run must not
    /// continue with a half-applied security posture.
    #[error("security error: {0}")]
    Security(String),

    /// The sandboxed command failed to exec or died on a signal.
    #[error("child error: {0}")]
    Child(String),

    /// debootstrap exited non-zero while creating the rootfs.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::kernel::syscall::SysError> for SandboxError {
    fn from(err: crate::kernel::syscall::SysError) -> Self {
        SandboxError::Resource(err.to_string())
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
