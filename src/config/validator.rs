//! Semantic validation of a parsed configuration.

use crate::config::types::SandboxConfiguration;
use crate::error::{Result, SandboxError};

const KNOWN_NAMESPACES: &[&str] = &["pid", "net", "ipc", "uts", "mount", "user"];

fn available_cpus() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

/// Validates the configuration before the engine takes any side effects.
pub fn validate(config: &SandboxConfiguration) -> Result<()> {
    if config.sandbox.name.is_empty() {
        return Err(SandboxError::Config("sandbox.name must not be empty".to_string()));
    }

    if config.sandbox.command.is_empty() {
        return Err(SandboxError::Config(
            "sandbox.command must contain at least one argument".to_string(),
        ));
    }

    if config.resources.memory_mb < 1 {
        return Err(SandboxError::Config(
            "resources.memory_mb must be at least 1".to_string(),
        ));
    }

    let cpu_ceiling = available_cpus() * 100;
    if config.resources.cpu_quota_percent < 1
        || config.resources.cpu_quota_percent > cpu_ceiling
    {
        return Err(SandboxError::Config(format!(
            "resources.cpu_quota_percent must be in 1..={} (got {})",
            cpu_ceiling, config.resources.cpu_quota_percent
        )));
    }

    for ns in &config.isolation.namespaces {
        if !KNOWN_NAMESPACES.contains(&ns.as_str()) {
            return Err(SandboxError::Config(format!(
                "unknown namespace kind: {}",
                ns
            )));
        }
    }

    if config.isolation.has_namespace("user") {
        let uid_map = config.isolation.uid_map.ok_or_else(|| {
            SandboxError::Config("user namespace requires isolation.uid_map".to_string())
        })?;
        let gid_map = config.isolation.gid_map.ok_or_else(|| {
            SandboxError::Config("user namespace requires isolation.gid_map".to_string())
        })?;
        if uid_map.count < 1 || gid_map.count < 1 {
            return Err(SandboxError::Config(
                "uid_map and gid_map counts must be at least 1".to_string(),
            ));
        }
    }

    match config.security.seccomp_policy.as_str() {
        "default" | "strict" | "log" | "allow" | "off" => {}
        other => {
            return Err(SandboxError::Config(format!(
                "unknown seccomp policy: {} (expected default, strict, log, allow, or off)",
                other
            )))
        }
    }

    for mount in &config.mounts.bind_mounts {
        if !mount.source.starts_with('/') || !mount.target.starts_with('/') {
            return Err(SandboxError::Config(format!(
                "bind mount paths must be absolute: {} -> {}",
                mount.source, mount.target
            )));
        }
    }

    Ok(())
}
