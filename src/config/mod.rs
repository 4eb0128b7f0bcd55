//! Configuration loading and validation.
//!
//! A configuration is a JSON document with top-level sections `sandbox`,
//! `resources`, `isolation`, `security`, `mounts`, `ai_module`, and
//! `logging`. Only `sandbox.command` and `resources.memory_mb` are required;
//! everything else defaults per [`types`].

pub mod types;
pub mod validator;

use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};
use self::types::SandboxConfiguration;

/// Environment variable selecting a default config file.
pub const CONFIG_PATH_ENV: &str = "SANDBOX_CONFIG_PATH";

const DEFAULT_CONFIG_CANDIDATES: &[&str] = &[
    "/etc/sandbox/default.json",
    "/var/lib/sandbox/config.json",
    "./config/default.json",
];

/// Parses a configuration from raw JSON text and validates it.
pub fn from_json(text: &str) -> Result<SandboxConfiguration> {
    let raw: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SandboxError::Config(format!("failed to parse JSON: {}", e)))?;

    check_required_keys(&raw)?;

    let config: SandboxConfiguration = serde_json::from_value(raw)
        .map_err(|e| SandboxError::Config(format!("invalid configuration value: {}", e)))?;

    validator::validate(&config)?;
    Ok(config)
}

/// Reads and parses a configuration file.
pub fn load_file(path: &Path) -> Result<SandboxConfiguration> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SandboxError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    from_json(&text)
}

/// Returns the default configuration path: `SANDBOX_CONFIG_PATH` if set,
/// otherwise the first existing well-known candidate.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    DEFAULT_CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// The only structurally required keys; everything else defaults.
fn check_required_keys(raw: &serde_json::Value) -> Result<()> {
    let sandbox = raw
        .get("sandbox")
        .ok_or_else(|| SandboxError::Config("config must contain a 'sandbox' section".to_string()))?;
    let resources = raw.get("resources").ok_or_else(|| {
        SandboxError::Config("config must contain a 'resources' section".to_string())
    })?;

    if sandbox.get("command").is_none() {
        return Err(SandboxError::Config(
            "sandbox config must contain 'command'".to_string(),
        ));
    }
    if resources.get("memory_mb").is_none() {
        return Err(SandboxError::Config(
            "resources config must contain 'memory_mb'".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "sandbox": { "command": ["/bin/true"] },
        "resources": { "memory_mb": 128 }
    }"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = from_json(MINIMAL).unwrap();
        assert_eq!(config.sandbox.command, vec!["/bin/true"]);
        assert_eq!(config.resources.memory_mb, 128);
        // Omitted sections keep their defaults.
        assert_eq!(config.sandbox.name, "sandbox-default");
        assert_eq!(config.resources.cpu_quota_percent, 50);
        assert_eq!(config.security.seccomp_policy, "default");
    }

    #[test]
    fn missing_sandbox_section_is_a_config_error() {
        let err = from_json(r#"{ "resources": { "memory_mb": 128 } }"#).unwrap_err();
        assert!(err.to_string().contains("'sandbox'"));
    }

    #[test]
    fn missing_command_is_a_config_error() {
        let err = from_json(
            r#"{ "sandbox": { "name": "x" }, "resources": { "memory_mb": 128 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn missing_memory_is_a_config_error() {
        let err = from_json(
            r#"{ "sandbox": { "command": ["/bin/true"] }, "resources": {} }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("memory_mb"));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = from_json("{ not json").unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = from_json(
            r#"{
                "sandbox": { "command": ["/bin/true"], "flavor": "mint" },
                "resources": { "memory_mb": 64 },
                "telemetry": { "endpoint": "nowhere" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.resources.memory_mb, 64);
    }

    #[test]
    fn uid_and_gid_maps_parse_from_json() {
        let config = from_json(
            r#"{
                "sandbox": { "command": ["/bin/true"] },
                "resources": { "memory_mb": 128 },
                "isolation": {
                    "namespaces": ["user", "mount"],
                    "uid_map": { "host_uid": 1000, "container_uid": 0, "count": 1 },
                    "gid_map": { "host_gid": 1000, "container_gid": 0, "count": 1 }
                }
            }"#,
        )
        .unwrap();

        let uid_map = config.isolation.uid_map.unwrap();
        assert_eq!(uid_map.host_uid, 1000);
        assert_eq!(uid_map.container_uid, 0);
        assert_eq!(uid_map.count, 1);
        let gid_map = config.isolation.gid_map.unwrap();
        assert_eq!(gid_map.host_gid, 1000);
    }

    #[test]
    fn bind_mounts_parse_with_read_only_default() {
        let config = from_json(
            r#"{
                "sandbox": { "command": ["/bin/true"] },
                "resources": { "memory_mb": 128 },
                "mounts": { "bind_mounts": [ { "source": "/tmp", "target": "/tmp" } ] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mounts.bind_mounts.len(), 1);
        assert!(!config.mounts.bind_mounts[0].read_only);
    }

    #[test]
    fn load_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = load_file(&path).unwrap();
        assert_eq!(config.resources.memory_mb, 128);

        let missing = load_file(&dir.path().join("nope.json"));
        assert!(missing.is_err());
    }
}
