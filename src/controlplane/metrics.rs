//! Reconcile Metrics
//!
//! Prometheus instruments for the convergence loop, registered in a
//! registry owned by the reconciler so several instances can coexist.

use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metrics of the convergence loop
#[derive(Clone)]
pub struct ReconcileMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    operations: IntCounterVec,
    duration: Histogram,
}

impl ReconcileMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "storage_client_reconciliations_total",
                "Reconcile passes by result",
            ),
            &["result"],
        )?;
        let operations = IntCounterVec::new(
            Opts::new(
                "storage_client_object_operations_total",
                "Operations performed on managed objects",
            ),
            &["kind", "operation"],
        )?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "storage_client_reconcile_duration_seconds",
            "Duration of reconcile passes",
        ))?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            operations,
            duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_reconcile(&self, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "failure" };
        self.reconciliations.with_label_values(&[result]).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub fn observe_operation(&self, kind: &str, operation: &str) {
        self.operations.with_label_values(&[kind, operation]).inc();
    }

    pub fn reconciliations(&self, result: &str) -> u64 {
        self.reconciliations.with_label_values(&[result]).get()
    }

    pub fn operations(&self, kind: &str, operation: &str) -> u64 {
        self.operations.with_label_values(&[kind, operation]).get()
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
