//! Ceph CSI Bundle
//!
//! Names, sidecar selection and templates of the objects the operator keeps
//! converged.

pub mod sidecars;
pub mod templates;

pub use sidecars::*;
pub use templates::*;

/// Cluster-scoped security policy of the CSI pods
pub const SCC_NAME: &str = "storage-client-csi";

/// Monitor endpoints, appended to by storage class claims
pub const MONITOR_CONFIG_MAP_NAME: &str = "ceph-csi-configs";

/// KMS settings, filled in by users before they create encrypted claims
pub const ENCRYPTION_CONFIG_MAP_NAME: &str = "ceph-csi-kms-config";

pub const CEPHFS_DEPLOYMENT_NAME: &str = "csi-cephfsplugin-provisioner";
pub const CEPHFS_DAEMONSET_NAME: &str = "csi-cephfsplugin";
pub const RBD_DEPLOYMENT_NAME: &str = "csi-rbdplugin-provisioner";
pub const RBD_DAEMONSET_NAME: &str = "csi-rbdplugin";

/// CephFS driver name; namespaced so several clients can share a cluster
pub fn cephfs_driver_name(namespace: &str) -> String {
    format!("{}.cephfs.csi.ceph.com", namespace)
}

pub fn rbd_driver_name(namespace: &str) -> String {
    format!("{}.rbd.csi.ceph.com", namespace)
}
