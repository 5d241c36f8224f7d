//! Bind mounts for sandboxed containers

use bollard::models::{Mount, MountTypeEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host directory exposed inside the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerMount {
    /// Path on the host
    pub host_path: PathBuf,
    /// Path inside the container
    pub container_path: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl DockerMount {
    /// Create a new read-only mount
    #[must_use]
    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    /// Create a new read-write mount
    #[must_use]
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Engine API bind mount, sourced from the already-validated host path
    #[must_use]
    pub(crate) fn to_bind(&self, resolved_source: &std::path::Path) -> Mount {
        Mount {
            target: Some(self.container_path.clone()),
            source: Some(resolved_source.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(self.read_only),
            ..Default::default()
        }
    }
}
