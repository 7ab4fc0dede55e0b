//! User-space daemon variant of the export backend.
//!
//! Exports live as EXPORT blocks in the ganesha configuration file and are
//! activated through the [`ControlChannel`]. Every block carries an
//! `Export_Id` that must be unique across the life of the daemon, including
//! across provisioner restarts, so the first publish after startup recovers
//! the high-water mark by scanning the configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{append_to_file, remove_from_file, ControlChannel, ExportBackend, ExportReceipt};
use crate::error::{Error, Result};

static EXPORT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Export_Id = ([0-9]+);").expect("export id pattern"));

pub struct GaneshaBackend {
    config_path: PathBuf,
    channel: Arc<dyn ControlChannel>,
    /// The backend mutex. Guards the configuration file, the control-channel
    /// calls, and the id counter; zero means "not yet recovered from disk".
    next_export_id: Mutex<u32>,
}

impl GaneshaBackend {
    pub fn new(config_path: impl Into<PathBuf>, channel: Arc<dyn ControlChannel>) -> Self {
        Self {
            config_path: config_path.into(),
            channel,
            next_export_id: Mutex::new(0),
        }
    }

    /// Highest Export_Id present in the configuration, or zero.
    fn max_export_id(config: &str) -> u32 {
        EXPORT_ID_RE
            .captures_iter(config)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .max()
            .unwrap_or(0)
    }

    fn build_block(export_id: u32, path: &Path) -> String {
        let path = path.display();
        format!(
            "\nEXPORT\n{{\n\
             \tExport_Id = {export_id};\n\
             \tPath = {path};\n\
             \tPseudo = {path};\n\
             \tAccess_Type = RW;\n\
             \tSquash = Root_squash;\n\
             \tSecType = sys;\n\
             \tFSAL {{\n\t\tName = VFS;\n\t}}\n}}\n"
        )
    }
}

#[async_trait]
impl ExportBackend for GaneshaBackend {
    async fn publish(&self, path: &Path) -> Result<ExportReceipt> {
        let mut next_id = self.next_export_id.lock().await;

        let config = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| {
                Error::Backend(format!("read {}: {e}", self.config_path.display()))
            })?;
        // First publish since startup: recover the id high-water mark so ids
        // stay unique across restarts.
        if *next_id == 0 {
            *next_id = Self::max_export_id(&config);
        }
        *next_id += 1;
        let export_id = *next_id;

        let block = Self::build_block(export_id, path);
        append_to_file(&self.config_path, &block).await?;

        if let Err(e) = self.channel.add_export(&self.config_path, path).await {
            if let Err(undo) = remove_from_file(&self.config_path, &block).await {
                warn!(error = %undo, "failed to roll back export block");
            }
            return Err(e);
        }

        debug!(export_id, path = %path.display(), "published ganesha export");
        Ok(ExportReceipt::Ganesha { block, export_id })
    }

    async fn unpublish(&self, path: &Path, receipt: &ExportReceipt) -> Result<()> {
        let ExportReceipt::Ganesha { block, export_id } = receipt else {
            return Err(Error::Internal(
                "ganesha backend asked to unpublish a non-ganesha receipt".to_string(),
            ));
        };

        let _guard = self.next_export_id.lock().await;
        self.channel.remove_export(*export_id).await?;
        remove_from_file(&self.config_path, block).await?;

        debug!(export_id, path = %path.display(), "unpublished ganesha export");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_highest_export_id() {
        let config = "EXPORT\n{\n\tExport_Id = 7;\n}\nEXPORT\n{\n\tExport_Id = 12;\n}\n";
        assert_eq!(GaneshaBackend::max_export_id(config), 12);
    }

    #[test]
    fn empty_config_scans_to_zero() {
        assert_eq!(GaneshaBackend::max_export_id(""), 0);
    }

    #[test]
    fn block_carries_id_and_path() {
        let block = GaneshaBackend::build_block(13, Path::new("/export/pvc-abc"));
        assert!(block.contains("Export_Id = 13;"));
        assert!(block.contains("Path = /export/pvc-abc;"));
        assert!(block.contains("Pseudo = /export/pvc-abc;"));
        assert!(block.contains("Access_Type = RW;"));
        assert!(block.contains("Squash = Root_squash;"));
        assert!(block.contains("SecType = sys;"));
        assert!(block.contains("Name = VFS;"));
    }
}
