//! The NFS provisioner: backs volumes with exported directories.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NFSVolumeSource, PersistentVolume, PersistentVolumeSpec};
use kube::api::ObjectMeta;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use super::groups::{self, IdRange};
use super::{Provisioner, VolumeOptions};
use crate::annotations;
use crate::cluster::ClusterOps;
use crate::error::{Error, Result};
use crate::export::{ExportBackend, ExportReceipt};

/// Sentinel cluster IP of headless services.
const CLUSTER_IP_NONE: &str = "None";

/// Directory mode for provisioned volumes: execute so kubelet can stat the
/// directory during unmount, nothing else.
const VOLUME_DIR_MODE: u32 = 0o071;

/// Pod-environment hints used to resolve the NFS server address.
#[derive(Debug, Clone, Default)]
pub struct PodEnv {
    pub pod_ip: Option<String>,
    pub service_name: Option<String>,
    pub namespace: Option<String>,
}

impl PodEnv {
    pub fn from_env() -> Self {
        fn non_empty(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }
        Self {
            pod_ip: non_empty("MY_POD_IP"),
            service_name: non_empty("MY_SERVICE_NAME"),
            namespace: non_empty("MY_POD_NAMESPACE"),
        }
    }
}

pub struct NfsProvisioner {
    /// The directory provisioned volume directories are created in.
    export_dir: PathBuf,
    cluster: Arc<dyn ClusterOps>,
    backend: Arc<dyn ExportBackend>,
    env: PodEnv,
    /// Gid ranges provisioned directories are grouped into.
    ranges: Vec<IdRange>,
}

impl NfsProvisioner {
    /// Build a provisioner from the pod's environment, discovering the gid
    /// ranges once.
    pub async fn new(
        export_dir: impl Into<PathBuf>,
        cluster: Arc<dyn ClusterOps>,
        backend: Arc<dyn ExportBackend>,
    ) -> Self {
        let env = PodEnv::from_env();
        let ranges = groups::discover_ranges(
            cluster.as_ref(),
            env.namespace.as_deref(),
            Path::new(groups::DOWNWARD_ANNOTATIONS),
        )
        .await;
        Self::with_environment(export_dir, cluster, backend, env, ranges)
    }

    pub fn with_environment(
        export_dir: impl Into<PathBuf>,
        cluster: Arc<dyn ClusterOps>,
        backend: Arc<dyn ExportBackend>,
        env: PodEnv,
        ranges: Vec<IdRange>,
    ) -> Self {
        Self {
            export_dir: export_dir.into(),
            cluster,
            backend,
            env,
            ranges,
        }
    }

    /// Resolve the server address to put in provisioned volumes.
    ///
    /// With a service-name hint the service is validated before use: volumes
    /// pointing at a broken service would be persistent in name only. Without
    /// one, the pod address is used directly.
    async fn get_server(&self) -> Result<String> {
        let pod_address = match &self.env.pod_ip {
            Some(ip) => ip.clone(),
            None => {
                info!("MY_POD_IP isn't set or provisioner isn't running as a pod, using `hostname -i`");
                hostname_ip().await?
            }
        };

        let Some(service_name) = self.env.service_name.clone() else {
            info!("MY_SERVICE_NAME isn't set, using the pod address as the NFS server");
            return Ok(pod_address);
        };
        let namespace = self.env.namespace.clone().ok_or_else(|| {
            Error::ServerLookup(
                "MY_SERVICE_NAME is set but MY_POD_NAMESPACE isn't; no way to get the service cluster IP"
                    .to_string(),
            )
        })?;

        let service = self
            .cluster
            .get_service(&namespace, &service_name)
            .await
            .map_err(|e| Error::ServerLookup(format!("getting service {service_name}: {e}")))?
            .ok_or_else(|| {
                Error::ServerLookup(format!("service {service_name} not found in {namespace}"))
            })?;
        let endpoints = self
            .cluster
            .get_endpoints(&namespace, &service_name)
            .await
            .map_err(|e| Error::ServerLookup(format!("getting endpoints {service_name}: {e}")))?
            .ok_or_else(|| {
                Error::ServerLookup(format!("endpoints {service_name} not found in {namespace}"))
            })?;

        let expected: HashSet<(i32, String)> = [
            (2049, "TCP"),
            (20048, "TCP"),
            (111, "UDP"),
            (111, "TCP"),
        ]
        .into_iter()
        .map(|(port, protocol)| (port, protocol.to_string()))
        .collect();

        let valid = endpoints.subsets.unwrap_or_default().iter().any(|subset| {
            let addresses = subset.addresses.as_deref().unwrap_or_default();
            if addresses.len() != 1 || addresses[0].ip != pod_address {
                return false;
            }
            let actual: HashSet<(i32, String)> = subset
                .ports
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|p| {
                    (
                        p.port,
                        p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    )
                })
                .collect();
            actual == expected
        });
        if !valid {
            return Err(Error::ServerLookup(format!(
                "service {service_name} has no endpoint subset targeting this pod ({pod_address}) with the NFS port set"
            )));
        }

        match service.spec.and_then(|s| s.cluster_ip) {
            Some(ip) if ip != CLUSTER_IP_NONE && !ip.is_empty() => Ok(ip),
            _ => Err(Error::ServerLookup(format!(
                "service {service_name} is valid but it doesn't have a cluster IP"
            ))),
        }
    }

    /// Create the backing directory with the volume mode and a sampled
    /// supplemental group. Leaves nothing behind on failure.
    async fn create_directory(&self, path: &Path) -> Result<i64> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| Error::fs(path.display().to_string(), e))?
        {
            return Err(Error::fs(
                path.display().to_string(),
                "the path already exists",
            ));
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::fs(path.display().to_string(), e))?;

        let result = self.mode_and_group(path).await;
        if result.is_err() {
            remove_directory(path).await;
        }
        result
    }

    async fn mode_and_group(&self, path: &Path) -> Result<i64> {
        // set_permissions applies the exact mode, unlike the mkdir mode which
        // the process umask masks.
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(VOLUME_DIR_MODE))
            .await
            .map_err(|e| Error::fs(path.display().to_string(), format!("chmod: {e}")))?;

        let gid = groups::pick_group(&self.ranges)?;
        std::os::unix::fs::chown(path, None, Some(gid as u32))
            .map_err(|e| Error::fs(path.display().to_string(), format!("chgrp {gid}: {e}")))?;
        Ok(gid)
    }
}

#[async_trait]
impl Provisioner for NfsProvisioner {
    #[instrument(skip(self, options), fields(volume = %options.pv_name))]
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume> {
        if !options.parameters.is_empty() {
            return Err(Error::Unsupported(
                "no storage class parameters are supported".to_string(),
            ));
        }
        if options.selector.is_some() {
            return Err(Error::Unsupported(
                "claim selectors are not supported".to_string(),
            ));
        }

        let server = self.get_server().await?;

        // The directory has to exist before AddExport or exportfs sees it.
        let path = self.export_dir.join(&options.pv_name);
        let gid = self.create_directory(&path).await?;

        let receipt = match self.backend.publish(&path).await {
            Ok(receipt) => receipt,
            Err(e) => {
                remove_directory(&path).await;
                return Err(e);
            }
        };

        let mut ann = BTreeMap::new();
        ann.insert(
            annotations::CREATED_BY.to_string(),
            annotations::CREATED_BY_VALUE.to_string(),
        );
        ann.insert(annotations::GID.to_string(), gid.to_string());
        receipt.annotate(&mut ann);

        info!(server = %server, path = %path.display(), gid, "provisioned export");

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name),
                annotations: Some(ann),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy),
                access_modes: Some(options.access_modes),
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    options.capacity,
                )])),
                nfs: Some(NFSVolumeSource {
                    server,
                    path: path.display().to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }),
            status: None,
        })
    }

    #[instrument(skip(self, volume), fields(volume = %volume.metadata.name.as_deref().unwrap_or("")))]
    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let ann = volume
            .metadata
            .annotations
            .as_ref()
            .ok_or_else(|| Error::Internal("volume has no annotations".to_string()))?;
        let receipt = ExportReceipt::from_annotations(ann)?;
        let path = volume
            .spec
            .as_ref()
            .and_then(|s| s.nfs.as_ref())
            .map(|nfs| PathBuf::from(&nfs.path))
            .ok_or_else(|| Error::Internal("volume has no NFS source".to_string()))?;

        // The directory may only disappear once the NFS layer stopped
        // serving it.
        self.backend.unpublish(&path, &receipt).await?;
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| Error::fs(path.display().to_string(), e))?;

        info!(path = %path.display(), "deleted export");
        Ok(())
    }
}

/// Best-effort cleanup used on provisioning failure paths.
async fn remove_directory(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!(path = %path.display(), error = %e, "failed to clean up volume directory");
    }
}

async fn hostname_ip() -> Result<String> {
    let output = Command::new("hostname")
        .arg("-i")
        .output()
        .await
        .map_err(|e| Error::ServerLookup(format!("hostname -i: {e}")))?;
    if !output.status.success() {
        return Err(Error::ServerLookup(format!(
            "hostname -i failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let ip = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if ip.is_empty() {
        return Err(Error::ServerLookup(
            "hostname -i printed nothing".to_string(),
        ));
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Mutex;

    struct MockBackend {
        fail_publish: bool,
        published: Mutex<Vec<PathBuf>>,
        unpublished: Mutex<Vec<PathBuf>>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_publish: false,
                published: Mutex::new(Vec::new()),
                unpublished: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_publish: true,
                published: Mutex::new(Vec::new()),
                unpublished: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ExportBackend for MockBackend {
        async fn publish(&self, path: &Path) -> Result<ExportReceipt> {
            if self.fail_publish {
                return Err(Error::Backend("injected publish failure".to_string()));
            }
            self.published.lock().unwrap().push(path.to_path_buf());
            Ok(ExportReceipt::Kernel {
                line: format!("\n{} *(rw,insecure,root_squash)\n", path.display()),
            })
        }

        async fn unpublish(&self, path: &Path, _receipt: &ExportReceipt) -> Result<()> {
            self.unpublished.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn options(pv_name: &str) -> VolumeOptions {
        VolumeOptions {
            pv_name: pv_name.to_string(),
            capacity: Quantity("1Mi".to_string()),
            access_modes: vec!["ReadWriteMany".to_string()],
            reclaim_policy: "Delete".to_string(),
            parameters: BTreeMap::new(),
            selector: None,
        }
    }

    /// A gid range pinned to the gid the test process can actually chgrp to.
    fn own_gid_range(dir: &Path) -> Vec<IdRange> {
        let gid = std::fs::metadata(dir).unwrap().gid() as i64;
        vec![IdRange { min: gid, max: gid }]
    }

    fn provisioner(
        export_dir: &Path,
        backend: Arc<MockBackend>,
        env: PodEnv,
        ranges: Vec<IdRange>,
    ) -> NfsProvisioner {
        NfsProvisioner::with_environment(
            export_dir,
            Arc::new(FakeCluster::new()),
            backend,
            env,
            ranges,
        )
    }

    fn pod_env() -> PodEnv {
        PodEnv {
            pod_ip: Some("10.0.0.5".to_string()),
            service_name: None,
            namespace: None,
        }
    }

    #[tokio::test]
    async fn rejects_class_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), MockBackend::new(), pod_env(), own_gid_range(dir.path()));

        let mut opts = options("pvc-x");
        opts.parameters.insert("foo".to_string(), "bar".to_string());

        assert!(matches!(
            p.provision(opts).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn rejects_claim_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), MockBackend::new(), pod_env(), own_gid_range(dir.path()));

        let mut opts = options("pvc-x");
        opts.selector = Some(LabelSelector::default());

        assert!(matches!(
            p.provision(opts).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn provisions_a_directory_backed_volume() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let p = provisioner(dir.path(), backend.clone(), pod_env(), own_gid_range(dir.path()));

        let pv = p.provision(options("pvc-uid-1")).await.unwrap();

        let path = dir.path().join("pvc-uid-1");
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, VOLUME_DIR_MODE);
        assert_eq!(backend.published.lock().unwrap().as_slice(), &[path.clone()]);

        assert_eq!(pv.metadata.name.as_deref(), Some("pvc-uid-1"));
        let ann = pv.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            ann.get(annotations::CREATED_BY).map(String::as_str),
            Some(annotations::CREATED_BY_VALUE)
        );
        assert!(ann.contains_key(annotations::GID));
        assert!(ann.contains_key(annotations::EXPORTS_LINE));

        let nfs = pv.spec.as_ref().unwrap().nfs.as_ref().unwrap();
        assert_eq!(nfs.server, "10.0.0.5");
        assert_eq!(nfs.path, path.display().to_string());
        assert_eq!(nfs.read_only, Some(false));
    }

    #[tokio::test]
    async fn refuses_to_reuse_an_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), MockBackend::new(), pod_env(), own_gid_range(dir.path()));
        std::fs::create_dir(dir.path().join("pvc-uid-1")).unwrap();

        assert!(matches!(
            p.provision(options("pvc-uid-1")).await,
            Err(Error::Filesystem { .. })
        ));
    }

    #[tokio::test]
    async fn publish_failure_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), MockBackend::failing(), pod_env(), own_gid_range(dir.path()));

        assert!(matches!(
            p.provision(options("pvc-uid-1")).await,
            Err(Error::Backend(_))
        ));
        assert!(!dir.path().join("pvc-uid-1").exists());
    }

    #[tokio::test]
    async fn delete_unpublishes_then_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let p = provisioner(dir.path(), backend.clone(), pod_env(), own_gid_range(dir.path()));

        let pv = p.provision(options("pvc-uid-1")).await.unwrap();
        let path = dir.path().join("pvc-uid-1");
        assert!(path.exists());

        p.delete(&pv).await.unwrap();
        assert!(!path.exists());
        assert_eq!(backend.unpublished.lock().unwrap().as_slice(), &[path]);
    }

    fn nfs_service(cluster_ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("nfs".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn nfs_endpoints(pod_ip: &str, ports: &[(i32, &str)]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("nfs".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: pod_ip.to_string(),
                    ..Default::default()
                }]),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, protocol)| EndpointPort {
                            port: *port,
                            protocol: Some(protocol.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    const NFS_PORTS: &[(i32, &str)] = &[
        (2049, "TCP"),
        (20048, "TCP"),
        (111, "UDP"),
        (111, "TCP"),
    ];

    fn service_env() -> PodEnv {
        PodEnv {
            pod_ip: Some("10.0.0.5".to_string()),
            service_name: Some("nfs".to_string()),
            namespace: Some("default".to_string()),
        }
    }

    #[tokio::test]
    async fn server_lookup_uses_the_service_cluster_ip() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(nfs_service("10.96.0.1"));
        cluster.add_endpoints(nfs_endpoints("10.0.0.5", NFS_PORTS));

        let dir = tempfile::tempdir().unwrap();
        let p = NfsProvisioner::with_environment(
            dir.path(),
            cluster,
            MockBackend::new(),
            service_env(),
            own_gid_range(dir.path()),
        );

        assert_eq!(p.get_server().await.unwrap(), "10.96.0.1");
    }

    #[tokio::test]
    async fn server_lookup_rejects_wrong_port_set() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(nfs_service("10.96.0.1"));
        cluster.add_endpoints(nfs_endpoints("10.0.0.5", &[(2049, "TCP")]));

        let dir = tempfile::tempdir().unwrap();
        let p = NfsProvisioner::with_environment(
            dir.path(),
            cluster,
            MockBackend::new(),
            service_env(),
            own_gid_range(dir.path()),
        );

        assert!(matches!(
            p.get_server().await,
            Err(Error::ServerLookup(_))
        ));
    }

    #[tokio::test]
    async fn server_lookup_rejects_foreign_endpoint_address() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(nfs_service("10.96.0.1"));
        cluster.add_endpoints(nfs_endpoints("10.0.0.99", NFS_PORTS));

        let dir = tempfile::tempdir().unwrap();
        let p = NfsProvisioner::with_environment(
            dir.path(),
            cluster,
            MockBackend::new(),
            service_env(),
            own_gid_range(dir.path()),
        );

        assert!(matches!(
            p.get_server().await,
            Err(Error::ServerLookup(_))
        ));
    }

    #[tokio::test]
    async fn server_lookup_rejects_headless_services() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(nfs_service(CLUSTER_IP_NONE));
        cluster.add_endpoints(nfs_endpoints("10.0.0.5", NFS_PORTS));

        let dir = tempfile::tempdir().unwrap();
        let p = NfsProvisioner::with_environment(
            dir.path(),
            cluster,
            MockBackend::new(),
            service_env(),
            own_gid_range(dir.path()),
        );

        assert!(matches!(
            p.get_server().await,
            Err(Error::ServerLookup(_))
        ));
    }

    #[tokio::test]
    async fn server_lookup_requires_namespace_with_service_name() {
        let dir = tempfile::tempdir().unwrap();
        let env = PodEnv {
            pod_ip: Some("10.0.0.5".to_string()),
            service_name: Some("nfs".to_string()),
            namespace: None,
        };
        let p = provisioner(dir.path(), MockBackend::new(), env, own_gid_range(dir.path()));

        assert!(matches!(
            p.get_server().await,
            Err(Error::ServerLookup(_))
        ));
    }
}
