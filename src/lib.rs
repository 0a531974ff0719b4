//! Storage Client Operator - CSI Bundle Convergence
//!
//! A Kubernetes operator that keeps the Ceph CSI driver bundle of a storage
//! client (security policy, bootstrap config maps, provisioner Deployments,
//! node-plugin DaemonSets and CSIDriver registrations) converged with its
//! templates whenever the cluster version changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                 Trigger Source (ClusterVersion controller)                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Reconcile Core                                  │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Sidecar      │  │    Template     │  │      Apply Protocols        │  │
//! │  │    Catalog      │  │    Provider     │  │  (create-or-update / once)  │  │
//! │  └─────────────────┘  └─────────────────┘  └──────────────┬──────────────┘  │
//! │                                                           │                  │
//! │                                            ┌──────────────┴──────────────┐  │
//! │                                            │     Ownership Wiring        │  │
//! │                                            └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Resource Clients                                    │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │      Kubernetes API         │  │     In-Memory (tests/standalone)    │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Controller, reconciler, apply protocols and clients
//! - [`csi`]: CSI object names, sidecar catalog and templates
//! - [`crd`]: Platform resource types
//! - [`domain`]: Core domain types, ownership wiring and traits
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod csi;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    KubeResourceClient, MemoryResourceClient, ObjectOutcome, Operation,
    ReconcileMetrics, ReconcilePhase, ReconcileReport, Reconciler, ReconcilerConfig,
};

pub use crd::{ClusterVersion, ClusterVersionStatus, Release, SecurityContextConstraints};

pub use csi::{CsiConfig, CsiTemplates, SidecarCatalog};

pub use domain::ownership::Owner;

pub use domain::ports::{
    CreateOutcome, ObjectKey, OperationResult, ResourceClient, SidecarImages,
    SidecarInitializer, TemplateFactory, TemplateProvider,
};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
