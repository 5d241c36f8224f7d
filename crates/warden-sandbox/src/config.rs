//! Settings loading
//!
//! Layers, lowest priority first: embedded defaults, an optional settings
//! file, then `WARDEN_*` environment variables.

use crate::backend::BackendKind;
use crate::container::DockerConfig;
use crate::policy::Policy;
use ::config::{Config, Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Everything needed to build a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Backend selection
    pub backend: BackendKind,
    /// Policy applied to every execution
    pub policy: Policy,
    /// Container backend settings
    pub docker: DockerConfig,
}

/// Load settings from the embedded defaults, `path` and the environment
pub fn load_settings(path: Option<&Path>) -> Result<SandboxSettings> {
    let mut builder =
        Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    // prefix_separator("_") so WARDEN_POLICY__TIMEOUT_MS maps to policy.timeout_ms
    let config = builder
        .add_source(
            Environment::with_prefix("WARDEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::NetworkMode;
    use crate::policy::Capability;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    /// Process environment is shared by every test thread
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn test_embedded_defaults_match_code_defaults() {
        let settings = {
            let _env = env_lock();
            load_settings(None).unwrap()
        };
        assert_eq!(settings.backend, BackendKind::Auto);
        assert_eq!(settings.policy.memory_limit_mb(), 16);
        assert_eq!(
            settings.policy.max_output_bytes(),
            Policy::new().max_output_bytes()
        );
        assert_eq!(settings.policy.timeout(), Duration::from_secs(30));
        assert!(settings.policy.capabilities().is_empty());
        assert!(settings.policy.allowed_commands().is_empty());
        assert_eq!(settings.docker.network_mode, NetworkMode::None);
        assert_eq!(settings.docker.memory_limit, 256 * 1024 * 1024);
        assert_eq!(settings.docker.cap_drop, vec!["ALL".to_string()]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
backend = "bytecode"

[policy]
capabilities = ["exec_run", "fs_read"]
allowed_commands = ["echo"]
fuel_limit = 5000
timeout_ms = 250

[docker]
network_mode = "BRIDGE"
"#
        )
        .unwrap();

        let settings = {
            let _env = env_lock();
            load_settings(Some(file.path())).unwrap()
        };
        assert_eq!(settings.backend, BackendKind::Bytecode);
        assert!(settings.policy.has_capability(Capability::ExecRun));
        assert!(settings.policy.has_capability(Capability::FsRead));
        assert!(!settings.policy.has_capability(Capability::NetHttp));
        assert_eq!(settings.policy.allowed_commands(), ["echo".to_string()]);
        assert_eq!(settings.policy.fuel_limit(), 5000);
        assert_eq!(settings.policy.timeout(), Duration::from_millis(250));
        assert_eq!(settings.docker.network_mode, NetworkMode::Bridge);
        assert!(settings.docker.readonly_rootfs);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let _env = env_lock();
        assert!(load_settings(Some(Path::new("/nonexistent/warden.toml"))).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let settings = {
            let _env = env_lock();
            std::env::set_var("WARDEN_POLICY__MAX_OUTPUT_BYTES", "4096");
            let settings = load_settings(None);
            std::env::remove_var("WARDEN_POLICY__MAX_OUTPUT_BYTES");
            settings
        };

        assert_eq!(settings.unwrap().policy.max_output_bytes(), 4096);
    }
}
