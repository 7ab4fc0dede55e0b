//! Dynamic NFS persistent-volume provisioner for Kubernetes.
//!
//! Watches storage classes, claims and volumes; when an unbound claim names a
//! class owned by this provisioner, a backing directory is created on the
//! shared filesystem, published as an NFS export and registered with the
//! cluster as a persistent volume. Released volumes with the Delete reclaim
//! policy go through the same machinery in reverse.
//!
//! # Architecture
//!
//! ```text
//! cluster events ──▶ ProvisionController ──▶ NfsProvisioner ──▶ ExportBackend
//!                      (classify, dedupe)      (dir, gid, PV)     (config + NFS
//!                                                                  control plane)
//! ```
//!
//! # Modules
//!
//! - [`annotations`] - Wire annotation keys shared with other processes
//! - [`cluster`] - The cluster surface port and its kube adapter
//! - [`controller`] - Reconciliation loop, class cache, operation registry
//! - [`error`] - Error types
//! - [`export`] - Ganesha and kernel export backends
//! - [`metrics`] - Prometheus counters
//! - [`nfsd`] - Kernel NFS daemon lifecycle glue
//! - [`seed`] - Static export seeding
//! - [`volume`] - The provisioner itself

pub mod annotations;
pub mod cluster;
pub mod controller;
pub mod error;
pub mod export;
pub mod metrics;
pub mod nfsd;
pub mod seed;
pub mod volume;

// Re-export commonly used types
pub use cluster::{ClusterOps, KubeCluster};
pub use controller::{OperationRegistry, ProvisionController};
pub use error::{Error, Result};
pub use export::{ExportBackend, GaneshaBackend, KernelBackend, SystemBusChannel};
pub use volume::{NfsProvisioner, Provisioner};
