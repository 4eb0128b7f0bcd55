//! Configuration data model.
//!
//! The configuration is an immutable snapshot held by the engine for the
//! lifetime of one run. All sections and fields default individually, so a
//! config file only needs `sandbox.command` and `resources.memory_mb`.
//! Unknown keys are ignored.

use serde::Deserialize;

/// Complete sandbox configuration container.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SandboxConfiguration {
    pub sandbox: SandboxSection,
    pub resources: ResourcesSection,
    pub isolation: IsolationSection,
    pub security: SecuritySection,
    pub mounts: MountsSection,
    pub ai_module: AiModuleSection,
    pub logging: LoggingSection,
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            sandbox: SandboxSection::default(),
            resources: ResourcesSection::default(),
            isolation: IsolationSection::default(),
            security: SecuritySection::default(),
            mounts: MountsSection::default(),
            ai_module: AiModuleSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// Core sandbox identity and command.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Identifier used in the cgroup path and process title.
    pub name: String,
    pub hostname: String,
    pub rootfs_path: String,
    /// Command and arguments to execute. Required, non-empty.
    pub command: Vec<String>,
    /// Run debootstrap when the rootfs does not exist.
    pub auto_bootstrap: bool,
    pub distro: String,
    pub release: String,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            name: "sandbox-default".to_string(),
            hostname: "sandbox-container".to_string(),
            rootfs_path: "/var/lib/sandbox/rootfs/ubuntu_focal".to_string(),
            command: vec!["/bin/bash".to_string()],
            auto_bootstrap: false,
            distro: "ubuntu".to_string(),
            release: "focal".to_string(),
        }
    }
}

/// Resource limits enforced through cgroup v2.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub memory_mb: u64,
    /// Percentage of one CPU; 100 per core is the ceiling.
    pub cpu_quota_percent: u64,
    /// 0 leaves pids.max unset.
    pub max_pids: u64,
    /// When false the swap limit is pinned to 0.
    pub enable_swap: bool,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_quota_percent: 50,
            max_pids: 100,
            enable_swap: false,
        }
    }
}

/// One line of a user-namespace UID mapping.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UidMap {
    pub host_uid: u32,
    pub container_uid: u32,
    pub count: u32,
}

impl Default for UidMap {
    fn default() -> Self {
        Self {
            host_uid: 1000,
            container_uid: 0,
            count: 1,
        }
    }
}

/// One line of a user-namespace GID mapping.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GidMap {
    pub host_gid: u32,
    pub container_gid: u32,
    pub count: u32,
}

impl Default for GidMap {
    fn default() -> Self {
        Self {
            host_gid: 1000,
            container_gid: 0,
            count: 1,
        }
    }
}

/// Namespace selection and id maps.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IsolationSection {
    /// Subset of {pid, net, ipc, uts, mount, user}.
    pub namespaces: Vec<String>,
    pub uid_map: Option<UidMap>,
    pub gid_map: Option<GidMap>,
}

impl Default for IsolationSection {
    fn default() -> Self {
        Self {
            namespaces: ["pid", "net", "ipc", "uts", "mount", "user"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            uid_map: Some(UidMap::default()),
            gid_map: Some(GidMap::default()),
        }
    }
}

impl IsolationSection {
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|n| n == name)
    }
}

/// Capability retention and seccomp policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Capability names (CAP_*) the child keeps. Empty means none.
    pub capabilities: Vec<String>,
    /// One of: default, strict, log, allow, off.
    pub seccomp_policy: String,
    /// Optional custom seccomp profile (one syscall name per line).
    pub seccomp_profile_path: String,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            seccomp_policy: "default".to_string(),
            seccomp_profile_path: String::new(),
        }
    }
}

/// One configured bind mount.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    /// Target inside the new root.
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Bind mounts, applied in order inside the new root.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MountsSection {
    pub bind_mounts: Vec<BindMount>,
}

impl Default for MountsSection {
    fn default() -> Self {
        Self {
            bind_mounts: vec![BindMount {
                source: "/tmp".to_string(),
                target: "/tmp".to_string(),
                read_only: false,
            }],
        }
    }
}

/// Chat-completion collaborator used to analyze run failures.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AiModuleSection {
    pub enabled: bool,
    pub provider: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub auto_report_errors: bool,
}

impl Default for AiModuleSection {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4-turbo".to_string(),
            temperature: 0.2,
            max_tokens: 1000,
            system_prompt: "You are a sandbox assistant that helps analyze and configure \
                            sandbox environments."
                .to_string(),
            auto_report_errors: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// error, warn, info, debug, or trace.
    pub level: String,
    /// stdout or file.
    pub output: String,
    pub log_file: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            log_file: String::new(),
        }
    }
}
