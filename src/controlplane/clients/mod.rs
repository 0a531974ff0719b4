//! Resource Client Adapters
//!
//! Provides implementations of the resource client port:
//! - Kubernetes: the platform API server
//! - Memory: an in-process store with platform semantics

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;
