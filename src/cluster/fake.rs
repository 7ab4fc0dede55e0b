//! In-memory [`ClusterOps`] double for unit tests.
//!
//! Watches are left pending so the reconciler is driven purely by resync
//! relists, which keeps test timing deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Endpoints, Namespace, PersistentVolume, PersistentVolumeClaim, Service,
};
use k8s_openapi::api::policy::v1beta1::PodSecurityPolicy;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::ErrorResponse;

use super::{ClusterOps, CreateOutcome, DeleteOutcome, WatchEvent};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct FakeCluster {
    classes: Mutex<Vec<StorageClass>>,
    claims: Mutex<Vec<PersistentVolumeClaim>>,
    volumes: Mutex<Vec<PersistentVolume>>,
    services: Mutex<Vec<Service>>,
    endpoints: Mutex<Vec<Endpoints>>,
    namespaces: Mutex<Vec<Namespace>>,
    policies: Mutex<Vec<PodSecurityPolicy>>,
    /// Number of upcoming create_volume calls that should fail.
    fail_creates: AtomicU32,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&self, class: StorageClass) {
        self.classes.lock().unwrap().push(class);
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        self.claims.lock().unwrap().push(claim);
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        self.volumes.lock().unwrap().push(volume);
    }

    pub fn add_service(&self, service: Service) {
        self.services.lock().unwrap().push(service);
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.endpoints.lock().unwrap().push(endpoints);
    }

    pub fn add_namespace(&self, namespace: Namespace) {
        self.namespaces.lock().unwrap().push(namespace);
    }

    pub fn add_pod_security_policy(&self, policy: PodSecurityPolicy) {
        self.policies.lock().unwrap().push(policy);
    }

    pub fn remove_claim(&self, namespace: &str, name: &str) {
        self.claims.lock().unwrap().retain(|c| {
            c.metadata.namespace.as_deref() != Some(namespace)
                || c.metadata.name.as_deref() != Some(name)
        });
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn volumes_snapshot(&self) -> Vec<PersistentVolume> {
        self.volumes.lock().unwrap().clone()
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v.metadata.name.clone())
            .collect();
        names.sort();
        names
    }
}

fn synthetic_api_error(code: u16, message: &str) -> Error {
    Error::ClusterWrite(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: String::new(),
        code,
    }))
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.classes.lock().unwrap().clone())
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims.lock().unwrap().clone())
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes.lock().unwrap().clone())
    }

    fn watch_storage_classes(&self) -> BoxStream<'static, WatchEvent<StorageClass>> {
        futures::stream::pending().boxed()
    }

    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<PersistentVolumeClaim>> {
        futures::stream::pending().boxed()
    }

    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<PersistentVolume>> {
        futures::stream::pending().boxed()
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims.lock().unwrap().iter().cloned().find(|c| {
            c.metadata.namespace.as_deref() == Some(namespace)
                && c.metadata.name.as_deref() == Some(name)
        }))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .find(|v| v.metadata.name.as_deref() == Some(name)))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<CreateOutcome> {
        if self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(synthetic_api_error(500, "injected create failure"));
        }
        let mut volumes = self.volumes.lock().unwrap();
        if volumes
            .iter()
            .any(|v| v.metadata.name == volume.metadata.name)
        {
            return Ok(CreateOutcome::AlreadyExists);
        }
        volumes.push(volume.clone());
        Ok(CreateOutcome::Created)
    }

    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome> {
        let mut volumes = self.volumes.lock().unwrap();
        let before = volumes.len();
        volumes.retain(|v| v.metadata.name.as_deref() != Some(name));
        if volumes.len() == before {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.services.lock().unwrap().iter().cloned().find(|s| {
            s.metadata.namespace.as_deref() == Some(namespace)
                && s.metadata.name.as_deref() == Some(name)
        }))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(self.endpoints.lock().unwrap().iter().cloned().find(|e| {
            e.metadata.namespace.as_deref() == Some(namespace)
                && e.metadata.name.as_deref() == Some(name)
        }))
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .find(|n| n.metadata.name.as_deref() == Some(name)))
    }

    async fn get_pod_security_policy(&self, name: &str) -> Result<Option<PodSecurityPolicy>> {
        Ok(self
            .policies
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .find(|p| p.metadata.name.as_deref() == Some(name)))
    }
}
