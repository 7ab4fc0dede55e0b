//! Annotation keys shared across the provisioner and the reconciler.
//!
//! These are exact-match wire keys; other processes (kubelet, the PV binder,
//! a replacement provisioner reading our volumes) depend on them.

/// Who created this PV. Always set to [`CREATED_BY_VALUE`] at provision time.
pub const CREATED_BY: &str = "kubernetes.io/createdby";

/// The value stamped under [`CREATED_BY`].
pub const CREATED_BY_VALUE: &str = "nfs-dynamic-provisioner";

/// Supplemental GID of the volume's backing directory, as a decimal string.
/// Kubelet applies it to pods using the volume.
pub const GID: &str = "pv.beta.kubernetes.io/gid";

/// The entire ganesha EXPORT block backing this PV (daemon variant).
pub const EXPORT_BLOCK: &str = "EXPORT_block";

/// The Export_Id of this PV's ganesha EXPORT, needed for deletion
/// (daemon variant).
pub const EXPORT_ID: &str = "Export_Id";

/// The line in /etc/exports backing this PV, needed for deletion
/// (kernel variant).
pub const EXPORTS_LINE: &str = "etcexports_line";

/// The storage class a claim requests and a provisioned volume belongs to.
pub const CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// The provisioner name that owns a dynamically provisioned volume.
pub const PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
