//! nsbox: a Linux process sandbox.
//!
//! Launches a user-supplied command in a confined execution domain built
//! from kernel isolation primitives (namespaces, cgroups v2, seccomp-bpf,
//! capabilities, pivot_root) and reports its completion. One engine instance
//! supervises one sandboxed process tree.

pub mod ai;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod kernel;
pub mod module;
pub mod modules;

pub use self::config::types::SandboxConfiguration;
pub use self::core::{SandboxEngine, SandboxResult, SandboxState};
pub use self::error::{Result, SandboxError};
