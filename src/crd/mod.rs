//! Platform resource types not covered by `k8s-openapi`
//!
//! This module contains:
//! - ClusterVersion: the signal object whose changes drive reconciliation
//! - SecurityContextConstraints: the cluster-scoped CSI security policy

pub mod cluster_version;
pub mod security_context_constraints;

pub use cluster_version::*;
pub use security_context_constraints::*;
