//! Static export seeding.
//!
//! Exports listed in a JSON file are provisioned once at startup through the
//! same provision entry point dynamic claims use. Seeded volumes get the
//! Retain reclaim policy so releasing them never destroys data the operator
//! placed there deliberately. Individual failures are logged and skipped;
//! seeding never aborts startup.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::cluster::ClusterOps;
use crate::error::Result;
use crate::volume::{Provisioner, VolumeOptions};

const RECLAIM_RETAIN: &str = "Retain";

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteMany".to_string()]
}

/// One entry of the seed file.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StaticExport {
    /// Volume object name, also the directory name under the export dir.
    pub name: String,
    /// Capacity to advertise, e.g. "1Gi".
    pub capacity: String,
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

/// Provision every export in the seed file, if it exists. Returns how many
/// volumes were created.
pub async fn provision_static(
    cluster: &dyn ClusterOps,
    provisioner: &dyn Provisioner,
    seed_file: &Path,
) -> Result<usize> {
    if !seed_file.exists() {
        debug!(path = %seed_file.display(), "no seed file, skipping static exports");
        return Ok(0);
    }

    let contents = tokio::fs::read_to_string(seed_file).await?;
    let exports: Vec<StaticExport> = serde_json::from_str(&contents)
        .map_err(|e| crate::error::Error::Config(format!("parsing {}: {e}", seed_file.display())))?;

    let mut created = 0;
    for export in exports {
        let name = export.name.clone();
        match provision_one(cluster, provisioner, export).await {
            Ok(true) => created += 1,
            Ok(false) => debug!(volume = %name, "static export already provisioned"),
            Err(e) => error!(volume = %name, error = %e, "provisioning static export failed"),
        }
    }
    if created > 0 {
        info!(created, "provisioned static exports");
    }
    Ok(created)
}

async fn provision_one(
    cluster: &dyn ClusterOps,
    provisioner: &dyn Provisioner,
    export: StaticExport,
) -> Result<bool> {
    // Idempotent across restarts.
    if cluster.get_volume(&export.name).await?.is_some() {
        return Ok(false);
    }

    let options = VolumeOptions {
        pv_name: export.name,
        capacity: Quantity(export.capacity),
        access_modes: export.access_modes,
        reclaim_policy: RECLAIM_RETAIN.to_string(),
        parameters: BTreeMap::new(),
        selector: None,
    };
    let volume = provisioner.provision(options).await?;
    cluster.create_volume(&volume).await?;
    Ok(true)
}
