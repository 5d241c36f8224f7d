//! `fs_read` / `fs_write`

use super::HostBridge;
use crate::error::{Error, Result};
use crate::policy::Capability;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

impl HostBridge {
    /// Read a file inside the allowed directories
    ///
    /// Files longer than `max_output_bytes` are truncated to that length
    /// without an error. Callers that need the complete content must compare
    /// the returned length against the cap themselves.
    pub async fn fs_read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        self.check_capability(Capability::FsRead, "fs_read")?;
        let resolved = self.validate_path(path)?;

        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|e| Error::runtime_with(format!("failed to open {}", resolved.display()), e))?;

        let limit = self.policy.max_output_bytes();
        let mut data = Vec::new();
        file.take(limit as u64)
            .read_to_end(&mut data)
            .await
            .map_err(|e| Error::runtime_with(format!("failed to read {}", resolved.display()), e))?;

        debug!(path = %resolved.display(), bytes = data.len(), "fs_read");
        Ok(data)
    }

    /// Create or overwrite a file inside the allowed directories
    ///
    /// Parent directories are created as needed; new files are private to
    /// the owner.
    pub async fn fs_write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        self.check_capability(Capability::FsWrite, "fs_write")?;
        let resolved = self.validate_path(path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::runtime_with(format!("failed to create {}", parent.display()), e)
            })?;
        }

        // The resolved path has no links left; one appearing now was planted since
        if let Ok(meta) = tokio::fs::symlink_metadata(&resolved).await {
            if meta.file_type().is_symlink() {
                return Err(Error::denied(format!(
                    "path \"{}\" is a symbolic link",
                    resolved.display()
                )));
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&resolved)
            .await
            .map_err(|e| Error::runtime_with(format!("failed to open {}", resolved.display()), e))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::runtime_with(format!("failed to write {}", resolved.display()), e))?;
        file.flush().await?;

        debug!(path = %resolved.display(), bytes = data.len(), "fs_write");
        Ok(())
    }
}
