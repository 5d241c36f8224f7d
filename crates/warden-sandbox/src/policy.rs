//! Execution policy: granted capabilities plus resource and allow-list limits

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default memory ceiling for the bytecode backend
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 16;

/// Absolute memory ceiling the bytecode backend accepts (4 GiB)
pub const MAX_MEMORY_LIMIT_MB: u32 = 4096;

/// Default per-execution timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default output cap (1 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A permission that must be granted before a gated operation may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read files inside the allowed directories
    FsRead,
    /// Create or overwrite files inside the allowed directories
    FsWrite,
    /// Issue outbound HTTP requests
    NetHttp,
    /// Spawn allow-listed subprocesses
    ExecRun,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 4] = [
        Capability::FsRead,
        Capability::FsWrite,
        Capability::NetHttp,
        Capability::ExecRun,
    ];

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FsRead => "fs_read",
            Self::FsWrite => "fs_write",
            Self::NetHttp => "net_http",
            Self::ExecRun => "exec_run",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of what one execution may do
///
/// Deny-by-default: no capability is granted, commands default closed, and
/// file access falls back to `working_dir`. Hosts are the one open default:
/// with `net_http` granted and no `allowed_hosts`, every host is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    capabilities: BTreeSet<Capability>,
    memory_limit_mb: u32,
    fuel_limit: u64,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    timeout: Duration,
    working_dir: Option<PathBuf>,
    allowed_paths: Vec<PathBuf>,
    allowed_hosts: Vec<String>,
    allowed_commands: Vec<String>,
    max_output_bytes: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            capabilities: BTreeSet::new(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            fuel_limit: 0,
            timeout: DEFAULT_TIMEOUT,
            working_dir: None,
            allowed_paths: Vec::new(),
            allowed_hosts: Vec::new(),
            allowed_commands: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl Policy {
    /// Restrictive default policy
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a capability
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Grant several capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    /// Memory ceiling in MiB (0 restores the default)
    #[must_use]
    pub fn with_memory_limit_mb(mut self, mb: u32) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Instruction budget (0 = unlimited)
    #[must_use]
    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = fuel;
        self
    }

    /// Wall-clock budget per execution
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Working directory for subprocesses and the fallback allow-list entry
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add a directory to the file allow-list
    #[must_use]
    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.allowed_paths.contains(&path) {
            self.allowed_paths.push(path);
        }
        self
    }

    /// Add a host (substring of the URL) to the HTTP allow-list
    #[must_use]
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        if !self.allowed_hosts.contains(&host) {
            self.allowed_hosts.push(host);
        }
        self
    }

    /// Add a command (base name or full path) to the exec allow-list
    #[must_use]
    pub fn allow_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        if !self.allowed_commands.contains(&command) {
            self.allowed_commands.push(command);
        }
        self
    }

    /// Output cap in bytes (0 restores the default)
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Pure membership test
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Granted capabilities
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Effective memory ceiling in MiB (unset falls back to the default)
    #[must_use]
    pub fn memory_limit_mb(&self) -> u32 {
        if self.memory_limit_mb == 0 {
            DEFAULT_MEMORY_LIMIT_MB
        } else {
            self.memory_limit_mb
        }
    }

    /// Instruction budget, 0 when unlimited
    #[must_use]
    pub fn fuel_limit(&self) -> u64 {
        self.fuel_limit
    }

    /// Wall-clock budget
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Configured working directory
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Explicit file allow-list
    #[must_use]
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    /// HTTP host allow-list (empty = every host)
    #[must_use]
    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// Exec allow-list (empty = nothing may run)
    #[must_use]
    pub fn allowed_commands(&self) -> &[String] {
        &self.allowed_commands
    }

    /// Effective output cap (unset falls back to 1 MiB)
    #[must_use]
    pub fn max_output_bytes(&self) -> usize {
        if self.max_output_bytes == 0 {
            DEFAULT_MAX_OUTPUT_BYTES
        } else {
            self.max_output_bytes
        }
    }

    /// Directories file access is confined to; `None` means unrestricted
    #[must_use]
    pub fn effective_allowed_paths(&self) -> Option<Vec<PathBuf>> {
        if !self.allowed_paths.is_empty() {
            Some(self.allowed_paths.clone())
        } else {
            self.working_dir().map(|dir| vec![dir.to_path_buf()])
        }
    }
}

/// Serialize a [`Duration`] as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_capability() {
        let policy = Policy::new().with_capabilities([Capability::FsRead, Capability::NetHttp]);
        assert!(policy.has_capability(Capability::FsRead));
        assert!(policy.has_capability(Capability::NetHttp));
        assert!(!policy.has_capability(Capability::FsWrite));

        let empty = Policy::new();
        for capability in Capability::ALL {
            assert!(!empty.has_capability(capability));
        }
    }

    #[test]
    fn test_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.memory_limit_mb(), 16);
        assert_eq!(policy.fuel_limit(), 0);
        assert_eq!(policy.timeout(), Duration::from_secs(30));
        assert_eq!(policy.max_output_bytes(), 1024 * 1024);
        assert!(policy.allowed_commands().is_empty());
        assert!(policy.effective_allowed_paths().is_none());
    }

    #[test]
    fn test_zero_limits_fall_back() {
        let policy = Policy::new()
            .with_memory_limit_mb(0)
            .with_max_output_bytes(0);
        assert_eq!(policy.memory_limit_mb(), DEFAULT_MEMORY_LIMIT_MB);
        assert_eq!(policy.max_output_bytes(), DEFAULT_MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_allowed_paths_fall_back_to_working_dir() {
        let policy = Policy::new().with_working_dir("/srv/work");
        assert_eq!(
            policy.effective_allowed_paths(),
            Some(vec![PathBuf::from("/srv/work")])
        );

        let policy = policy.allow_path("/data").allow_path("/data");
        assert_eq!(
            policy.effective_allowed_paths(),
            Some(vec![PathBuf::from("/data")])
        );
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::FsRead.to_string(), "fs_read");
        assert_eq!(Capability::FsWrite.to_string(), "fs_write");
        assert_eq!(Capability::NetHttp.to_string(), "net_http");
        assert_eq!(Capability::ExecRun.to_string(), "exec_run");
    }
}
