//! Container backend configuration

use super::mount::DockerMount;
use super::network::NetworkMode;
use crate::policy::{duration_ms, DEFAULT_MAX_OUTPUT_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for container execution
///
/// Defaults are hardened: no network, read-only root filesystem, every Linux
/// capability dropped and privilege escalation disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image reference
    pub image: String,
    /// Bind mounts; each host path must pass the policy's path check
    pub mounts: Vec<DockerMount>,
    /// Network mode
    pub network_mode: NetworkMode,
    /// Memory limit in bytes (0 = unlimited)
    pub memory_limit: u64,
    /// CPU quota in microseconds per 100ms period (0 = unlimited, 100000 = 1 CPU)
    pub cpu_quota: i64,
    /// Maximum execution time per run
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Environment variables; names must match `[A-Za-z_][A-Za-z0-9_]*`
    pub env: BTreeMap<String, String>,
    /// User to run as (e.g. "nobody", "1000:1000")
    pub user: Option<String>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Read-only root filesystem
    pub readonly_rootfs: bool,
    /// Linux capabilities to drop
    pub cap_drop: Vec<String>,
    /// Linux capabilities to add back
    pub cap_add: Vec<String>,
    /// Security options
    pub security_opt: Vec<String>,
    /// Extra labels; `warden.sandbox=true` is always set
    pub labels: BTreeMap<String, String>,
    /// Output cap per stream
    pub max_output_bytes: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            mounts: Vec::new(),
            network_mode: NetworkMode::None,
            memory_limit: 256 * 1024 * 1024,
            cpu_quota: 50_000,
            timeout: Duration::from_secs(30),
            env: BTreeMap::new(),
            user: None,
            working_dir: None,
            readonly_rootfs: true,
            cap_drop: vec!["ALL".to_string()],
            cap_add: Vec::new(),
            security_opt: vec!["no-new-privileges".to_string()],
            labels: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl DockerConfig {
    /// Use a different image
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Add a bind mount
    #[must_use]
    pub fn with_mount(mut self, mount: DockerMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Set the network mode
    #[must_use]
    pub fn with_network(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    /// Set the memory limit in MiB
    #[must_use]
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit = mb * 1024 * 1024;
        self
    }

    /// Set the per-run timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run as `user`
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the per-stream output cap
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Effective output cap (unset falls back to 1 MiB)
    #[must_use]
    pub fn effective_max_output_bytes(&self) -> usize {
        if self.max_output_bytes == 0 {
            DEFAULT_MAX_OUTPUT_BYTES
        } else {
            self.max_output_bytes
        }
    }

    /// `KEY=VALUE` entries for variables with valid names
    #[must_use]
    pub(crate) fn env_entries(&self) -> Vec<String> {
        self.env
            .iter()
            .filter(|(key, _)| {
                let valid = is_valid_env_name(key);
                if !valid {
                    tracing::warn!(key = %key, "Skipping invalid environment variable name");
                }
                valid
            })
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// Validate environment variable name
pub(crate) fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit()
}
