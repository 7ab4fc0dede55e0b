//! Control channel to the NFS Ganesha daemon.
//!
//! Ganesha picks up new exports without a restart through its ExportMgr
//! object on the system bus:
//! <https://github.com/nfs-ganesha/nfs-ganesha/wiki/Dbusinterface>

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

const DEST: &str = "org.ganesha.nfsd";
const OBJECT: &str = "/org/ganesha/nfsd/ExportMgr";
const ADD_EXPORT: &str = "org.ganesha.nfsd.exportmgr.AddExport";
const REMOVE_EXPORT: &str = "org.ganesha.nfsd.exportmgr.RemoveExport";

/// Asks the ganesha daemon to start or stop serving an export.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Tell the daemon to load the export for `path` from `config`.
    async fn add_export(&self, config: &Path, path: &Path) -> Result<()>;

    /// Tell the daemon to drop the export with the given id.
    async fn remove_export(&self, export_id: u32) -> Result<()>;
}

/// The production channel, speaking to ganesha over the system message bus.
#[derive(Debug, Default, Clone)]
pub struct SystemBusChannel;

impl SystemBusChannel {
    pub fn new() -> Self {
        Self
    }

    async fn call(&self, method: &str, args: &[String]) -> Result<()> {
        let output = Command::new("dbus-send")
            .arg("--system")
            .arg("--print-reply")
            .arg(format!("--dest={DEST}"))
            .arg(OBJECT)
            .arg(method)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("spawn dbus-send: {e}")))?;
        if !output.status.success() {
            return Err(Error::Backend(format!(
                "{method} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for SystemBusChannel {
    async fn add_export(&self, config: &Path, path: &Path) -> Result<()> {
        self.call(
            ADD_EXPORT,
            &[
                format!("string:{}", config.display()),
                format!("string:export(path = {})", path.display()),
            ],
        )
        .await
    }

    async fn remove_export(&self, export_id: u32) -> Result<()> {
        self.call(REMOVE_EXPORT, &[format!("uint16:{export_id}")])
            .await
    }
}
