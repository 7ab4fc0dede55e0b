//! Cluster surface the provisioner consumes.
//!
//! The reconciler and the provisioner talk to the cluster only through the
//! [`ClusterOps`] port; [`kube::KubeCluster`] is the production adapter and
//! the unit tests substitute an in-memory fake driven by resync relists.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{
    Endpoints, Namespace, PersistentVolume, PersistentVolumeClaim, Service,
};
use k8s_openapi::api::policy::v1beta1::PodSecurityPolicy;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::error::Result;

mod kubernetes;
pub use kubernetes::KubeCluster;

#[cfg(test)]
pub mod fake;

/// A single observed change to a watched object kind.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// The object was added or modified (relists surface every live object
    /// this way).
    Applied(K),
    /// The object was removed from the cluster.
    Deleted(K),
}

/// Outcome of a persistent-volume create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A volume with this name already exists; the asset is registered.
    AlreadyExists,
}

/// Outcome of a persistent-volume delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The volume object was already gone.
    NotFound,
}

/// Everything the core reads from or writes to the cluster.
///
/// List + watch for the three object kinds the reconciler observes, create and
/// delete for persistent volumes only, and the point reads the provisioner
/// needs for server resolution and supplemental-group discovery.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>>;
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Watch streams terminate only on shutdown; adapters are expected to
    /// re-establish broken watches internally.
    fn watch_storage_classes(&self) -> BoxStream<'static, WatchEvent<StorageClass>>;
    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<PersistentVolumeClaim>>;
    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<PersistentVolume>>;

    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<CreateOutcome>;
    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn get_pod_security_policy(&self, name: &str) -> Result<Option<PodSecurityPolicy>>;
}
