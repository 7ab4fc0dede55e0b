//! Volume provisioning.
//!
//! [`Provisioner`] is the seam between the reconciler and the storage layer;
//! [`NfsProvisioner`] is the production implementation that backs volumes
//! with exported directories.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::Result;

pub mod groups;
mod provision;

pub use provision::{NfsProvisioner, PodEnv};

/// Everything the reconciler knows about the volume it wants created.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Name of the volume object, `"pvc-" + claim uid`.
    pub pv_name: String,
    /// Requested capacity, copied from the claim.
    pub capacity: Quantity,
    /// Access modes, copied from the claim.
    pub access_modes: Vec<String>,
    /// Reclaim policy for the new volume.
    pub reclaim_policy: String,
    /// Storage class parameters. This provisioner supports none.
    pub parameters: BTreeMap<String, String>,
    /// Claim selector. This provisioner supports none.
    pub selector: Option<LabelSelector>,
}

/// Creates and removes storage assets for volumes.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the storage asset and return the volume object describing it.
    /// The caller owns writing the object to the cluster.
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume>;

    /// Remove the storage asset behind a previously provisioned volume.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;
}
