//! Host Function Bridge - capability-checked host operations
//!
//! The four gated operations (`fs_read`, `fs_write`, `http_fetch`,
//! `exec_run`) are reachable from the bytecode backend's host imports and
//! reusable by the container backend for pre-flight validation. Every
//! operation checks its capability first and performs no I/O when denied.

mod exec;
mod fs;
mod http;

#[cfg(test)]
pub(crate) mod tests;

pub use exec::ProcessOutput;
pub use http::HttpResponse;

use crate::error::{Error, Result};
use crate::policy::{Capability, Policy};
use crate::validator::PathValidator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Capability-checked implementation of the gated host operations
#[derive(Debug, Clone)]
pub struct HostBridge {
    policy: Arc<Policy>,
    validator: PathValidator,
    client: reqwest::Client,
}

impl HostBridge {
    /// Create a bridge bound to `policy`
    pub fn new(policy: impl Into<Arc<Policy>>) -> Result<Self> {
        let policy = policy.into();
        let validator = PathValidator::new(&policy);
        let client = reqwest::Client::builder()
            .timeout(policy.timeout())
            .build()
            .map_err(|e| Error::runtime_with("failed to build http client", e))?;

        Ok(Self {
            policy,
            validator,
            client,
        })
    }

    /// The policy every operation is checked against
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Shared handle to the policy
    #[must_use]
    pub fn policy_arc(&self) -> Arc<Policy> {
        Arc::clone(&self.policy)
    }

    /// Fail with a capability error unless `capability` is granted
    pub fn check_capability(&self, capability: Capability, operation: &str) -> Result<()> {
        if self.policy.has_capability(capability) {
            return Ok(());
        }
        warn!(
            operation = %operation,
            capability = %capability,
            "operation denied: capability not granted"
        );
        Err(Error::missing_capability(capability, operation))
    }

    /// Resolve `path` and confine it to the allowed directories
    pub fn validate_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.validator.validate(path)
    }

    /// Check `command` against the exec allow-list
    ///
    /// An empty allow-list denies every command. A command matches when its
    /// base name or its full string equals an entry.
    pub fn validate_command(&self, command: &str) -> Result<()> {
        let allowed = self.policy.allowed_commands();
        if allowed.is_empty() {
            warn!(command = %command, "command denied: allow-list is empty");
            return Err(Error::denied(
                "no commands are allowed (AllowedCommands is empty)",
            ));
        }

        let base = command_base_name(command);
        if allowed.iter().any(|entry| entry == base || entry == command) {
            return Ok(());
        }

        warn!(command = %command, "command denied: not in allow-list");
        Err(Error::denied(format!(
            "command \"{command}\" is not in allowed list"
        )))
    }

    /// Check `url` against the host allow-list
    ///
    /// This is a substring test against the whole URL, not a parsed host
    /// comparison, so an allowed host appearing anywhere in the URL matches.
    pub fn validate_url(&self, url: &str) -> Result<()> {
        let allowed = self.policy.allowed_hosts();
        if allowed.is_empty() || allowed.iter().any(|host| url.contains(host.as_str())) {
            return Ok(());
        }
        warn!(url = %url, "http request denied: host not in allow-list");
        Err(Error::denied(format!(
            "host not in allowed list for URL: {url}"
        )))
    }
}

/// Last path segment of `command`
fn command_base_name(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(command)
}
