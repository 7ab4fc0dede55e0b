//! Kubernetes adapter for the [`ClusterOps`] port.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Endpoints, Namespace, PersistentVolume, PersistentVolumeClaim, Service,
};
use k8s_openapi::api::policy::v1beta1::PodSecurityPolicy;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{ClusterOps, CreateOutcome, DeleteOutcome, WatchEvent};
use crate::error::{Error, Result};

/// The production cluster adapter, backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    /// Wrap a kube watcher into the port's event stream. Watch errors are
    /// logged and the watcher re-establishes itself; relists surface as a
    /// burst of `Applied` events.
    fn watch<K>(api: Api<K>, kind: &'static str) -> BoxStream<'static, WatchEvent<K>>
    where
        K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
        K::DynamicType: Default,
    {
        watcher(api, watcher::Config::default())
            .flat_map(move |res| {
                let events = match res {
                    Ok(watcher::Event::Applied(obj)) => vec![WatchEvent::Applied(obj)],
                    Ok(watcher::Event::Deleted(obj)) => vec![WatchEvent::Deleted(obj)],
                    Ok(watcher::Event::Restarted(objs)) => {
                        objs.into_iter().map(WatchEvent::Applied).collect()
                    }
                    Err(e) => {
                        warn!(kind, error = %e, "watch error, stream will re-establish");
                        Vec::new()
                    }
                };
                futures::stream::iter(events)
            })
            .boxed()
    }
}

/// Map a kube `get` so that 404 becomes `None`.
fn ok_or_absent<K>(res: std::result::Result<K, kube::Error>) -> Result<Option<K>> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(Error::Kube(e)),
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes().list(&ListParams::default()).await?.items)
    }

    fn watch_storage_classes(&self) -> BoxStream<'static, WatchEvent<StorageClass>> {
        Self::watch(Api::all(self.client.clone()), "StorageClass")
    }

    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<PersistentVolumeClaim>> {
        Self::watch(Api::all(self.client.clone()), "PersistentVolumeClaim")
    }

    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<PersistentVolume>> {
        Self::watch(self.volumes(), "PersistentVolume")
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        ok_or_absent(self.volumes().get(name).await)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<CreateOutcome> {
        match self.volumes().create(&PostParams::default(), volume).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(Error::ClusterWrite(e)),
        }
    }

    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome> {
        match self.volumes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(Error::ClusterWrite(e)),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ok_or_absent(api.get(name).await)
    }

    async fn get_pod_security_policy(&self, name: &str) -> Result<Option<PodSecurityPolicy>> {
        let api: Api<PodSecurityPolicy> = Api::all(self.client.clone());
        ok_or_absent(api.get(name).await)
    }
}
