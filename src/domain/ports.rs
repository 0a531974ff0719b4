//! Domain Ports - Core trait definitions for the storage client operator
//!
//! These traits define the boundaries between the reconcile core and the
//! systems it drives. Adapters implement these traits to provide concrete
//! functionality.

use crate::crd::SecurityContextConstraints;
use crate::domain::ownership::{self, Owner};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Object Identity
// =============================================================================

/// Namespace and name of a cluster object. Cluster-scoped objects carry no
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an object from its metadata
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Operation Outcomes
// =============================================================================

/// Outcome of a create-or-update call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationResult::Created => write!(f, "created"),
            OperationResult::Updated => write!(f, "updated"),
            OperationResult::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Outcome of a create-only call. Failures travel in the `Err` arm of the
/// surrounding `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CreateOutcome {
    Created,
    AlreadyPresent,
}

impl std::fmt::Display for CreateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateOutcome::Created => write!(f, "created"),
            CreateOutcome::AlreadyPresent => write!(f, "already-present"),
        }
    }
}

// =============================================================================
// Resource Client Port
// =============================================================================

/// Port for cluster state access.
///
/// Objects cross this boundary untyped; `ApiResource` names the kind. `get`
/// reports a missing object as `Ok(None)`, `create` reports an existing one
/// as [`Error::ResourceExists`](crate::Error::ResourceExists) and `update`
/// reports a stale `resourceVersion` as
/// [`Error::Conflict`](crate::Error::Conflict).
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch the current state of an object
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// Create an object, returning the stored state
    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object, guarded by its `resourceVersion`
    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Make `child` subject to cascading deletion when `owner` goes away.
    ///
    /// Platforms with a garbage collector only need the owner reference;
    /// stores without one must honour the reference themselves.
    fn mark_for_cascade_delete(&self, owner: &Owner, child: &mut ObjectMeta) -> Result<()> {
        ownership::set_controller_reference(owner, child)
    }
}

// =============================================================================
// Template Provider Port
// =============================================================================

/// Desired state of every managed object, deterministic given the namespace
pub trait TemplateProvider: Send + Sync {
    fn security_context_constraints(&self, namespace: &str) -> SecurityContextConstraints;

    fn monitor_config_map(&self, namespace: &str) -> ConfigMap;

    fn encryption_config_map(&self, namespace: &str) -> ConfigMap;

    fn cephfs_deployment(&self, namespace: &str) -> Deployment;

    fn cephfs_daemonset(&self, namespace: &str) -> DaemonSet;

    fn rbd_deployment(&self, namespace: &str) -> Deployment;

    fn rbd_daemonset(&self, namespace: &str) -> DaemonSet;

    fn cephfs_csi_driver(&self, namespace: &str) -> CSIDriver;

    fn rbd_csi_driver(&self, namespace: &str) -> CSIDriver;
}

// =============================================================================
// Sidecar Initializer Port
// =============================================================================

/// Container images of the CSI sidecars
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarImages {
    pub provisioner: String,
    pub attacher: String,
    pub resizer: String,
    pub snapshotter: String,
    pub registrar: String,
}

/// Port selecting the sidecar images for a platform version
pub trait SidecarInitializer: Send + Sync {
    fn initialize(&self, version: &str) -> Result<SidecarImages>;
}

/// Port building the templates of one pass from the selected sidecar images
pub trait TemplateFactory: Send + Sync {
    fn templates(&self, images: SidecarImages) -> Box<dyn TemplateProvider>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceClientRef = Arc<dyn ResourceClient>;
pub type SidecarInitializerRef = Arc<dyn SidecarInitializer>;
pub type TemplateFactoryRef = Arc<dyn TemplateFactory>;
