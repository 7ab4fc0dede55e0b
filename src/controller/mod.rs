//! Reconciliation loop for claims and volumes.
//!
//! Three coordinated watch+resync activities run until shutdown: storage
//! classes feed the [`ClassCache`], claim events are classified through
//! [`ProvisionController::should_provision`], volume events through
//! [`ProvisionController::should_delete`]. Positive classifications dispatch
//! a worker that performs the full provision or delete; the
//! [`OperationRegistry`] enforces at most one in-flight operation per object
//! key.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::cluster::{ClusterOps, WatchEvent};
use crate::error::{Error, Result};
use crate::metrics;
use crate::volume::{Provisioner, VolumeOptions};

mod cache;
mod operations;

pub use cache::ClassCache;
pub use operations::{Operation, OperationRegistry};

/// Phase a released volume must be in before it is reclaimed.
const PHASE_RELEASED: &str = "Released";

/// Reclaim policy a volume must carry before its asset is deleted.
const RECLAIM_DELETE: &str = "Delete";

/// Watches claims and volumes and reconciles them against the provisioner.
#[derive(Clone)]
pub struct ProvisionController {
    cluster: Arc<dyn ClusterOps>,
    provisioner: Arc<dyn Provisioner>,
    provisioner_name: String,
    resync_period: Duration,
    create_provisioned_pv_interval: Duration,
    classes: Arc<ClassCache>,
    operations: Arc<OperationRegistry>,
}

impl ProvisionController {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        provisioner: Arc<dyn Provisioner>,
        provisioner_name: impl Into<String>,
        resync_period: Duration,
        create_provisioned_pv_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            provisioner,
            provisioner_name: provisioner_name.into(),
            resync_period,
            create_provisioned_pv_interval,
            classes: Arc::new(ClassCache::new()),
            operations: Arc::new(OperationRegistry::new()),
        }
    }

    /// The in-flight operation set, exposed for quiescence waiting.
    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    /// Run until `shutdown` fires, then drain in-flight operations.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(provisioner = %self.provisioner_name, "starting provision controller");

        let classes = tokio::spawn(self.clone().run_class_stream(shutdown.clone()));
        let claims = tokio::spawn(self.clone().run_claim_stream(shutdown.clone()));
        let volumes = tokio::spawn(self.clone().run_volume_stream(shutdown.clone()));
        let _ = tokio::join!(classes, claims, volumes);

        self.operations.wait().await;
        info!("provision controller stopped");
    }

    async fn run_class_stream(self, shutdown: CancellationToken) {
        let mut watch = self.cluster.watch_storage_classes();
        let mut resync = tokio::time::interval(self.resync_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => match self.cluster.list_storage_classes().await {
                    Ok(list) => {
                        for class in list {
                            self.classes.add(class);
                        }
                    }
                    Err(e) => warn!(error = %e, "listing storage classes failed"),
                },
                Some(event) = watch.next() => match event {
                    WatchEvent::Applied(class) => self.classes.add(class),
                    WatchEvent::Deleted(class) => {
                        if let Some(name) = class.metadata.name.as_deref() {
                            self.classes.delete(name);
                        }
                    }
                },
            }
        }
    }

    async fn run_claim_stream(self, shutdown: CancellationToken) {
        let mut watch = self.cluster.watch_claims();
        let mut resync = tokio::time::interval(self.resync_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => match self.cluster.list_claims().await {
                    Ok(list) => {
                        for claim in list {
                            self.dispatch_claim(claim);
                        }
                    }
                    Err(e) => warn!(error = %e, "listing claims failed"),
                },
                Some(event) = watch.next() => {
                    if let WatchEvent::Applied(claim) = event {
                        self.dispatch_claim(claim);
                    }
                },
            }
        }
    }

    async fn run_volume_stream(self, shutdown: CancellationToken) {
        let mut watch = self.cluster.watch_volumes();
        let mut resync = tokio::time::interval(self.resync_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => match self.cluster.list_volumes().await {
                    Ok(list) => {
                        for volume in list {
                            self.dispatch_volume(volume);
                        }
                    }
                    Err(e) => warn!(error = %e, "listing volumes failed"),
                },
                Some(event) = watch.next() => {
                    if let WatchEvent::Applied(volume) = event {
                        self.dispatch_volume(volume);
                    }
                },
            }
        }
    }

    fn dispatch_claim(&self, claim: PersistentVolumeClaim) {
        if !self.should_provision(&claim) {
            return;
        }
        let ctrl = self.clone();
        tokio::spawn(async move { ctrl.provision_claim(claim).await });
    }

    fn dispatch_volume(&self, volume: PersistentVolume) {
        if !self.should_delete(&volume) {
            return;
        }
        let ctrl = self.clone();
        tokio::spawn(async move { ctrl.reclaim_volume(volume).await });
    }

    /// A claim is provisioned iff it is unbound, names a cached class, and
    /// that class belongs to this provisioner.
    fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool {
        let bound = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .is_some_and(|v| !v.is_empty());
        if bound {
            return false;
        }
        let Some(class_name) = claim_class(claim) else {
            return false;
        };
        let Some(class) = self.classes.get(&class_name) else {
            return false;
        };
        class.provisioner == self.provisioner_name
    }

    /// A volume is reclaimed iff it is Released, its reclaim policy is
    /// Delete, and this provisioner dynamically provisioned it.
    fn should_delete(&self, volume: &PersistentVolume) -> bool {
        let released = volume
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == PHASE_RELEASED);
        let reclaim_delete = volume
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            .is_some_and(|p| p == RECLAIM_DELETE);
        let ours = volume
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::PROVISIONED_BY))
            .is_some_and(|p| p == &self.provisioner_name);
        released && reclaim_delete && ours
    }

    #[instrument(skip(self, claim), fields(claim = %claim_key(&claim)))]
    async fn provision_claim(self, claim: PersistentVolumeClaim) {
        let Some(uid) = claim.metadata.uid.clone() else {
            warn!("claim has no uid, skipping");
            return;
        };
        if !self.operations.start(Operation::Provision, &uid) {
            debug!("provision already in flight");
            return;
        }

        let result = self.do_provision(&claim).await;
        match &result {
            Ok(()) => metrics::PROVISION_TOTAL.with_label_values(&["success"]).inc(),
            Err(e) => {
                error!(error = %e, "provisioning failed");
                metrics::PROVISION_TOTAL.with_label_values(&["error"]).inc();
            }
        }

        self.operations.finish(Operation::Provision, &uid);
    }

    async fn do_provision(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let uid = claim
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::Internal("claim has no uid".to_string()))?;
        let pv_name = format!("pvc-{uid}");

        // Resyncs re-deliver unbound claims until the binder catches up; a
        // volume that already exists means a previous operation finished.
        if self.cluster.get_volume(&pv_name).await?.is_some() {
            debug!(volume = %pv_name, "volume already exists, nothing to do");
            return Ok(());
        }

        let class_name = claim_class(claim)
            .ok_or_else(|| Error::Internal("claim lost its class annotation".to_string()))?;
        let class = self
            .classes
            .get(&class_name)
            .ok_or_else(|| Error::Internal(format!("class {class_name} vanished from cache")))?;

        let spec = claim
            .spec
            .as_ref()
            .ok_or_else(|| Error::Internal("claim has no spec".to_string()))?;
        let capacity = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned()
            .unwrap_or_else(|| Quantity("0".to_string()));

        let options = VolumeOptions {
            pv_name: pv_name.clone(),
            capacity,
            access_modes: spec.access_modes.clone().unwrap_or_default(),
            reclaim_policy: RECLAIM_DELETE.to_string(),
            parameters: class.parameters.clone().unwrap_or_default(),
            selector: spec.selector.clone(),
        };

        let mut volume = self.provisioner.provision(options).await?;

        let ann = volume
            .metadata
            .annotations
            .get_or_insert_with(Default::default);
        ann.insert(
            annotations::PROVISIONED_BY.to_string(),
            self.provisioner_name.clone(),
        );
        ann.insert(annotations::CLASS.to_string(), class_name);
        if let Some(spec) = volume.spec.as_mut() {
            spec.claim_ref = Some(claim_ref(claim));
        }

        self.save_provisioned_volume(claim, volume, &pv_name).await
    }

    /// Write the provisioned volume to the cluster, retrying every
    /// `create_provisioned_pv_interval` until it succeeds or the triggering
    /// claim disappears or binds elsewhere. On give-up the storage asset is
    /// rolled back so nothing is left stranded.
    async fn save_provisioned_volume(
        &self,
        claim: &PersistentVolumeClaim,
        volume: PersistentVolume,
        pv_name: &str,
    ) -> Result<()> {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let claim_name = claim.metadata.name.clone().unwrap_or_default();

        loop {
            match self.cluster.create_volume(&volume).await {
                Ok(_) => {
                    info!(volume = %pv_name, "provisioned volume saved");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, volume = %pv_name, "failed to save provisioned volume, will retry");
                }
            }

            if self.claim_abandoned(&namespace, &claim_name, pv_name).await {
                warn!(volume = %pv_name, "claim deleted or bound elsewhere, rolling back storage asset");
                if let Err(e) = self.provisioner.delete(&volume).await {
                    error!(error = %e, volume = %pv_name, "rollback of storage asset failed");
                }
                return Err(Error::Internal(format!(
                    "gave up saving volume {pv_name}: claim no longer wants it"
                )));
            }

            sleep(self.create_provisioned_pv_interval).await;
        }
    }

    /// True once the claim is gone or bound to some other volume; the claim
    /// must be re-read on every retry.
    async fn claim_abandoned(&self, namespace: &str, name: &str, pv_name: &str) -> bool {
        match self.cluster.get_claim(namespace, name).await {
            Ok(None) => true,
            Ok(Some(current)) => current
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.as_deref())
                .is_some_and(|v| !v.is_empty() && v != pv_name),
            Err(e) => {
                warn!(error = %e, "re-reading claim failed, keeping volume");
                false
            }
        }
    }

    #[instrument(skip(self, volume), fields(volume = %volume.metadata.name.as_deref().unwrap_or("")))]
    async fn reclaim_volume(self, volume: PersistentVolume) {
        let Some(name) = volume.metadata.name.clone() else {
            warn!("volume has no name, skipping");
            return;
        };
        if !self.operations.start(Operation::Delete, &name) {
            debug!("delete already in flight");
            return;
        }

        let result = self.do_delete(&volume, &name).await;
        match &result {
            Ok(()) => metrics::DELETE_TOTAL.with_label_values(&["success"]).inc(),
            Err(e) => {
                error!(error = %e, "delete failed");
                metrics::DELETE_TOTAL.with_label_values(&["error"]).inc();
            }
        }

        self.operations.finish(Operation::Delete, &name);
    }

    async fn do_delete(&self, volume: &PersistentVolume, name: &str) -> Result<()> {
        // Remove the storage asset first; the volume object stays behind as
        // the record of the export until the asset is gone.
        self.provisioner.delete(volume).await?;

        loop {
            match self.cluster.delete_volume(name).await {
                Ok(_) => {
                    info!(volume = %name, "deleted volume");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, volume = %name, "failed to delete volume object, will retry");
                }
            }
            sleep(self.create_provisioned_pv_interval).await;
            if matches!(self.cluster.get_volume(name).await, Ok(None)) {
                return Ok(());
            }
        }
    }
}

/// The class a claim requests, from its class annotation with the spec field
/// as fallback. Empty values count as unset.
fn claim_class(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::CLASS).cloned())
        .or_else(|| {
            claim
                .spec
                .as_ref()
                .and_then(|s| s.storage_class_name.clone())
        })
        .filter(|c| !c.is_empty())
}

fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or(""),
        claim.metadata.name.as_deref().unwrap_or("")
    )
}

fn claim_ref(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        name: claim.metadata.name.clone(),
        namespace: claim.metadata.namespace.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}
