//! Sandbox lifecycle engine and result types.

pub mod engine;
pub mod types;

pub use self::engine::{AsyncSandbox, SandboxEngine, SandboxHandle};
pub use self::types::{SandboxResult, SandboxState};
