//! Kernel NFS server variant of the export backend.
//!
//! Exports are lines in `/etc/exports`; `exportfs -r` makes the kernel pick
//! up the current file contents.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{append_to_file, remove_from_file, ExportBackend, ExportReceipt};
use crate::error::{Error, Result};

pub struct KernelBackend {
    exports_path: PathBuf,
    refresh: Vec<String>,
    /// Backend mutex guarding the exports file and the refresh command.
    lock: Mutex<()>,
}

impl KernelBackend {
    pub fn new(exports_path: impl Into<PathBuf>) -> Self {
        Self::with_refresh_command(
            exports_path,
            vec!["exportfs".to_string(), "-r".to_string()],
        )
    }

    /// Override the refresh command. Tests point this at `true`/`false`.
    pub fn with_refresh_command(exports_path: impl Into<PathBuf>, refresh: Vec<String>) -> Self {
        Self {
            exports_path: exports_path.into(),
            refresh,
            lock: Mutex::new(()),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let (program, args) = self
            .refresh
            .split_first()
            .ok_or_else(|| Error::Config("empty exports refresh command".to_string()))?;
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("spawn {program}: {e}")))?;
        if !output.status.success() {
            return Err(Error::Backend(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExportBackend for KernelBackend {
    async fn publish(&self, path: &Path) -> Result<ExportReceipt> {
        let line = format!("\n{} *(rw,insecure,root_squash)\n", path.display());

        let _guard = self.lock.lock().await;
        append_to_file(&self.exports_path, &line).await?;
        if let Err(e) = self.refresh().await {
            if let Err(undo) = remove_from_file(&self.exports_path, &line).await {
                warn!(error = %undo, "failed to roll back exports line");
            }
            return Err(e);
        }

        debug!(path = %path.display(), "published kernel export");
        Ok(ExportReceipt::Kernel { line })
    }

    async fn unpublish(&self, path: &Path, receipt: &ExportReceipt) -> Result<()> {
        let ExportReceipt::Kernel { line } = receipt else {
            return Err(Error::Internal(
                "kernel backend asked to unpublish a non-kernel receipt".to_string(),
            ));
        };

        let _guard = self.lock.lock().await;
        remove_from_file(&self.exports_path, line).await?;
        self.refresh().await?;

        debug!(path = %path.display(), "unpublished kernel export");
        Ok(())
    }
}
