//! Control Plane Module
//!
//! The convergence loop: trigger source, reconcile core, apply protocols
//! and the resource client adapters.

pub mod apply;
pub mod clients;
pub mod controller;
pub mod metrics;
pub mod reconciler;

pub use clients::*;
pub use metrics::ReconcileMetrics;
pub use reconciler::*;
