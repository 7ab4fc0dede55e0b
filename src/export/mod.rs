//! Export backends.
//!
//! An export backend owns the export configuration and the path by which the
//! NFS layer is told to start or stop serving a directory. Two interchangeable
//! variants exist: [`GaneshaBackend`] drives a user-space NFS Ganesha daemon
//! through its configuration file and the system bus, [`KernelBackend`] drives
//! the kernel NFS server through `/etc/exports` and `exportfs`.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::annotations;
use crate::error::{Error, Result};

mod dbus;
mod ganesha;
mod kernel;

pub use dbus::{ControlChannel, SystemBusChannel};
pub use ganesha::GaneshaBackend;
pub use kernel::KernelBackend;

/// What a backend handed out for a published path. The receipt is the only
/// state needed to unpublish later; it is persisted as volume annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportReceipt {
    /// The ganesha EXPORT block appended to the configuration and its id.
    Ganesha { block: String, export_id: u32 },
    /// The line appended to /etc/exports.
    Kernel { line: String },
}

impl ExportReceipt {
    /// Stamp the receipt onto a volume's annotations.
    pub fn annotate(&self, annotations: &mut BTreeMap<String, String>) {
        match self {
            ExportReceipt::Ganesha { block, export_id } => {
                annotations.insert(annotations::EXPORT_BLOCK.to_string(), block.clone());
                annotations.insert(annotations::EXPORT_ID.to_string(), export_id.to_string());
            }
            ExportReceipt::Kernel { line } => {
                annotations.insert(annotations::EXPORTS_LINE.to_string(), line.clone());
            }
        }
    }

    /// Reconstruct a receipt from a provisioned volume's annotations.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        if let Some(block) = annotations.get(annotations::EXPORT_BLOCK) {
            let export_id = annotations
                .get(annotations::EXPORT_ID)
                .ok_or_else(|| {
                    Error::Internal(format!("{} annotation missing", annotations::EXPORT_ID))
                })?
                .parse::<u32>()
                .map_err(|e| {
                    Error::Internal(format!("bad {} annotation: {e}", annotations::EXPORT_ID))
                })?;
            return Ok(ExportReceipt::Ganesha {
                block: block.clone(),
                export_id,
            });
        }
        if let Some(line) = annotations.get(annotations::EXPORTS_LINE) {
            return Ok(ExportReceipt::Kernel { line: line.clone() });
        }
        Err(Error::Internal(
            "volume carries no export backend annotations".to_string(),
        ))
    }
}

/// Publishes and unpublishes directories over NFS.
///
/// Implementations serialise all configuration reads, writes and control-plane
/// calls behind a single backend mutex, and guarantee that a failed publish
/// restores the configuration file to its pre-call byte content.
#[async_trait]
pub trait ExportBackend: Send + Sync {
    /// Export `path`. The directory must already exist.
    async fn publish(&self, path: &Path) -> Result<ExportReceipt>;

    /// Stop exporting `path` and remove its configuration entry.
    async fn unpublish(&self, path: &Path, receipt: &ExportReceipt) -> Result<()>;
}

/// Append `text` to the file with a durable write (append, flush, sync).
async fn append_to_file(path: &Path, text: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::Backend(format!("open {} for append: {e}", path.display())))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| Error::Backend(format!("append to {}: {e}", path.display())))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Backend(format!("sync {}: {e}", path.display())))?;
    Ok(())
}

/// Excise the first occurrence of `text` from the file, restoring the
/// surrounding content byte for byte.
async fn remove_from_file(path: &Path, text: &str) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Backend(format!("read {}: {e}", path.display())))?;
    let removed = contents.replacen(text, "", 1);
    tokio::fs::write(path, removed)
        .await
        .map_err(|e| Error::Backend(format!("write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ganesha_receipt_survives_annotations() {
        let receipt = ExportReceipt::Ganesha {
            block: "\nEXPORT\n{\n}\n".to_string(),
            export_id: 13,
        };
        let mut ann = BTreeMap::new();
        receipt.annotate(&mut ann);

        assert_eq!(ann.get(annotations::EXPORT_ID).map(String::as_str), Some("13"));
        assert_eq!(ExportReceipt::from_annotations(&ann).unwrap(), receipt);
    }

    #[test]
    fn kernel_receipt_survives_annotations() {
        let receipt = ExportReceipt::Kernel {
            line: "\n/export/pvc-x *(rw,insecure,root_squash)\n".to_string(),
        };
        let mut ann = BTreeMap::new();
        receipt.annotate(&mut ann);

        assert!(ann.contains_key(annotations::EXPORTS_LINE));
        assert_eq!(ExportReceipt::from_annotations(&ann).unwrap(), receipt);
    }

    #[test]
    fn missing_annotations_are_an_error() {
        let ann = BTreeMap::new();
        assert!(ExportReceipt::from_annotations(&ann).is_err());
    }

    #[test]
    fn ganesha_receipt_requires_export_id() {
        let mut ann = BTreeMap::new();
        ann.insert(annotations::EXPORT_BLOCK.to_string(), "block".to_string());
        assert!(ExportReceipt::from_annotations(&ann).is_err());
    }
}
