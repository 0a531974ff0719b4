//! Reconcile Core
//!
//! Drives one convergence pass of the CSI bundle:
//!
//! ```text
//! FetchSignal → InitSidecars → ConvergeSecurityPolicy → BootstrapConfigMaps
//!             → ConvergeWorkloads → RegisterDrivers
//! ```
//!
//! The first failing phase aborts the pass. Earlier phases stay committed;
//! every phase is idempotent, so the next trigger simply starts over.

use crate::controlplane::apply::{self, ManagedObject};
use crate::controlplane::metrics::ReconcileMetrics;
use crate::crd::{ClusterVersion, SecurityContextConstraints};
use crate::domain::ownership::Owner;
use crate::domain::ports::{
    CreateOutcome, ObjectKey, OperationResult, ResourceClientRef, SidecarInitializerRef,
    TemplateFactoryRef, TemplateProvider,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta, Time};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

// =============================================================================
// Reconciler Configuration
// =============================================================================

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Namespace the operator runs in and deploys the CSI bundle to
    pub namespace: String,
    /// Requeue delay after a retryable failure
    pub error_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: "storage-client".to_string(),
            error_requeue: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Phases and Outcomes
// =============================================================================

/// Steps of a convergence pass, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconcilePhase {
    FetchSignal,
    InitSidecars,
    ConvergeSecurityPolicy,
    BootstrapConfigMaps,
    ConvergeWorkloads,
    RegisterDrivers,
}

impl std::fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcilePhase::FetchSignal => write!(f, "fetch-signal"),
            ReconcilePhase::InitSidecars => write!(f, "init-sidecars"),
            ReconcilePhase::ConvergeSecurityPolicy => write!(f, "converge-security-policy"),
            ReconcilePhase::BootstrapConfigMaps => write!(f, "bootstrap-config-maps"),
            ReconcilePhase::ConvergeWorkloads => write!(f, "converge-workloads"),
            ReconcilePhase::RegisterDrivers => write!(f, "register-drivers"),
        }
    }
}

/// What happened to one managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
    AlreadyPresent,
}

impl Operation {
    /// Whether the operation wrote to the cluster
    pub fn is_write(self) -> bool {
        matches!(self, Operation::Created | Operation::Updated)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Created => write!(f, "created"),
            Operation::Updated => write!(f, "updated"),
            Operation::Unchanged => write!(f, "unchanged"),
            Operation::AlreadyPresent => write!(f, "already-present"),
        }
    }
}

impl From<OperationResult> for Operation {
    fn from(result: OperationResult) -> Self {
        match result {
            OperationResult::Created => Operation::Created,
            OperationResult::Updated => Operation::Updated,
            OperationResult::Unchanged => Operation::Unchanged,
        }
    }
}

impl From<CreateOutcome> for Operation {
    fn from(outcome: CreateOutcome) -> Self {
        match outcome {
            CreateOutcome::Created => Operation::Created,
            CreateOutcome::AlreadyPresent => Operation::AlreadyPresent,
        }
    }
}

/// Outcome for a single object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectOutcome {
    pub kind: String,
    pub name: String,
    pub operation: Operation,
}

/// Summary of a successful convergence pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub request: ObjectKey,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ObjectOutcome>,
}

impl ReconcileReport {
    /// Number of writes the pass issued
    pub fn writes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.operation.is_write())
            .count()
    }

    /// Operation recorded for `kind`/`name`
    pub fn operation(&self, kind: &str, name: &str) -> Option<Operation> {
        self.outcomes
            .iter()
            .find(|o| o.kind == kind && o.name == name)
            .map(|o| o.operation)
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Owned workload whose labels and spec are taken wholesale from a template
pub trait Workload: ManagedObject + Default {
    fn adopt(&mut self, template: &Self);
}

impl Workload for Deployment {
    fn adopt(&mut self, template: &Self) {
        self.metadata.labels = template.metadata.labels.clone();
        self.spec = template.spec.clone();
    }
}

impl Workload for DaemonSet {
    fn adopt(&mut self, template: &Self) {
        self.metadata.labels = template.metadata.labels.clone();
        self.spec = template.spec.clone();
    }
}

/// Identity and versioning metadata assigned by the server
struct ServerMetadata {
    uid: Option<String>,
    resource_version: Option<String>,
    creation_timestamp: Option<Time>,
    generation: Option<i64>,
    managed_fields: Option<Vec<ManagedFieldsEntry>>,
    self_link: Option<String>,
}

impl ServerMetadata {
    fn capture(meta: &ObjectMeta) -> Self {
        Self {
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            creation_timestamp: meta.creation_timestamp.clone(),
            generation: meta.generation,
            managed_fields: meta.managed_fields.clone(),
            self_link: meta.self_link.clone(),
        }
    }

    fn restore(self, meta: &mut ObjectMeta) {
        meta.uid = self.uid;
        meta.resource_version = self.resource_version;
        meta.creation_timestamp = self.creation_timestamp;
        meta.generation = self.generation;
        meta.managed_fields = self.managed_fields;
        meta.self_link = self.self_link;
    }
}

fn shell_meta(template: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: template.name.clone(),
        namespace: template.namespace.clone(),
        ..Default::default()
    }
}

/// Log the failing phase and pass the error through
fn failed(phase: ReconcilePhase, err: Error) -> Error {
    error!(phase = %phase, error = %err, "Reconcile phase failed");
    err
}

// =============================================================================
// Reconciler
// =============================================================================

/// Converges the CSI bundle towards its templates
pub struct Reconciler {
    config: ReconcilerConfig,
    client: ResourceClientRef,
    owner: Owner,
    sidecars: SidecarInitializerRef,
    templates: TemplateFactoryRef,
    metrics: ReconcileMetrics,
}

impl Reconciler {
    /// Create a reconciler owning its subordinates through `owner`
    pub fn new(
        config: ReconcilerConfig,
        client: ResourceClientRef,
        owner: Owner,
        sidecars: SidecarInitializerRef,
        templates: TemplateFactoryRef,
    ) -> Result<Arc<Self>> {
        if config.namespace.is_empty() {
            return Err(Error::Configuration("operator namespace is empty".into()));
        }

        Ok(Arc::new(Self {
            config,
            client,
            owner,
            sidecars,
            templates,
            metrics: ReconcileMetrics::new()?,
        }))
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    /// Run one convergence pass for the signal object named by `request`
    pub async fn reconcile(&self, request: &ObjectKey) -> Result<ReconcileReport> {
        let started = Instant::now();
        info!(request = %request, "Reconciling ClusterVersion");

        let result = self.converge(request).await;
        self.metrics
            .observe_reconcile(result.is_ok(), started.elapsed());

        if let Ok(report) = &result {
            info!(
                request = %request,
                version = %report.version,
                writes = report.writes(),
                "Reconcile complete"
            );
        }
        result
    }

    async fn converge(&self, request: &ObjectKey) -> Result<ReconcileReport> {
        let started_at = Utc::now();

        let signal = self
            .fetch_signal(request)
            .await
            .map_err(|e| failed(ReconcilePhase::FetchSignal, e))?;
        let version = signal
            .desired_version()
            .ok_or_else(|| Error::SignalInvalid(format!("{} has no desired version", request)))
            .map_err(|e| failed(ReconcilePhase::FetchSignal, e))?
            .to_string();

        let images = self
            .sidecars
            .initialize(&version)
            .map_err(|e| failed(ReconcilePhase::InitSidecars, e))?;
        let templates = self.templates.templates(images);

        let mut outcomes = Vec::with_capacity(9);

        outcomes.push(
            self.converge_security_policy(templates.as_ref())
                .await
                .map_err(|e| failed(ReconcilePhase::ConvergeSecurityPolicy, e))?,
        );

        let namespace = &self.config.namespace;
        for config_map in [
            templates.monitor_config_map(namespace),
            templates.encryption_config_map(namespace),
        ] {
            outcomes.push(
                self.bootstrap_config_map(config_map)
                    .await
                    .map_err(|e| failed(ReconcilePhase::BootstrapConfigMaps, e))?,
            );
        }

        outcomes.extend(
            self.converge_workloads(templates.as_ref())
                .await
                .map_err(|e| failed(ReconcilePhase::ConvergeWorkloads, e))?,
        );

        for driver in [
            templates.cephfs_csi_driver(namespace),
            templates.rbd_csi_driver(namespace),
        ] {
            outcomes.push(
                self.register_driver(driver)
                    .await
                    .map_err(|e| failed(ReconcilePhase::RegisterDrivers, e))?,
            );
        }

        Ok(ReconcileReport {
            request: request.clone(),
            version,
            started_at,
            outcomes,
        })
    }

    async fn fetch_signal(&self, request: &ObjectKey) -> Result<ClusterVersion> {
        let resource = apply::api_resource::<ClusterVersion>();
        let object = self
            .client
            .get(&resource, request)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: request.to_string(),
            })?;
        apply::from_dynamic(&object)
    }

    /// The policy is cluster-scoped, so it is refreshed from the template
    /// without an owner; only the server-assigned metadata survives.
    async fn converge_security_policy(
        &self,
        templates: &dyn TemplateProvider,
    ) -> Result<ObjectOutcome> {
        let desired = templates.security_context_constraints(&self.config.namespace);
        let name = desired.metadata.name.clone();
        let mut scc = SecurityContextConstraints {
            metadata: shell_meta(&desired.metadata),
            ..Default::default()
        };

        let result = apply::create_or_update(self.client.as_ref(), &mut scc, move |current| {
            let preserved = ServerMetadata::capture(&current.metadata);
            *current = desired;
            preserved.restore(&mut current.metadata);
            Ok(())
        })
        .await
        .map_err(|e| {
            error!(name = ?name, error = %e, "Unable to create/update SCC");
            e
        })?;

        Ok(self.record::<SecurityContextConstraints>(&scc.metadata, result.into()))
    }

    /// Config maps are seeded once; afterwards their content belongs to users.
    async fn bootstrap_config_map(&self, config_map: ConfigMap) -> Result<ObjectOutcome> {
        let outcome = apply::create_if_absent(self.client.as_ref(), &config_map)
            .await
            .map_err(|e| {
                error!(name = ?config_map.metadata.name, error = %e, "Failed to create config map");
                e
            })?;

        Ok(self.record::<ConfigMap>(&config_map.metadata, outcome.into()))
    }

    async fn converge_workloads(
        &self,
        templates: &dyn TemplateProvider,
    ) -> Result<Vec<ObjectOutcome>> {
        let namespace = &self.config.namespace;

        let (cephfs_deployment, cephfs_daemonset, rbd_deployment, rbd_daemonset) = futures::join!(
            self.converge_owned(templates.cephfs_deployment(namespace)),
            self.converge_owned(templates.cephfs_daemonset(namespace)),
            self.converge_owned(templates.rbd_deployment(namespace)),
            self.converge_owned(templates.rbd_daemonset(namespace)),
        );

        let mut outcomes = Vec::with_capacity(4);
        let mut errors = Vec::new();
        for result in [cephfs_deployment, cephfs_daemonset, rbd_deployment, rbd_daemonset] {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            return Ok(outcomes);
        }
        if errors.len() == 1 {
            if let Some(err) = errors.pop() {
                return Err(err);
            }
        }
        Err(Error::Aggregate(errors))
    }

    async fn converge_owned<W: Workload>(&self, desired: W) -> Result<ObjectOutcome> {
        let mut object = W::default();
        *object.meta_mut() = shell_meta(desired.meta());

        let client = self.client.as_ref();
        let owner = &self.owner;
        let result = apply::create_or_update(client, &mut object, |current| {
            client.mark_for_cascade_delete(owner, current.meta_mut())?;
            current.adopt(&desired);
            Ok(())
        })
        .await
        .map_err(|e| {
            error!(
                kind = %W::kind(&()),
                name = ?desired.meta().name,
                error = %e,
                "Failed to create/update workload"
            );
            e
        })?;

        Ok(self.record::<W>(object.meta(), result.into()))
    }

    /// Driver registrations are cluster-scoped and cannot be owned; they are
    /// created once and not reconciled afterwards.
    async fn register_driver(&self, driver: CSIDriver) -> Result<ObjectOutcome> {
        let outcome = apply::create_if_absent(self.client.as_ref(), &driver)
            .await
            .map_err(|e| {
                error!(name = ?driver.metadata.name, error = %e, "Unable to create CSIDriver");
                e
            })?;

        Ok(self.record::<CSIDriver>(&driver.metadata, outcome.into()))
    }

    fn record<K: ManagedObject>(&self, meta: &ObjectMeta, operation: Operation) -> ObjectOutcome {
        let kind = K::kind(&()).into_owned();
        let name = ObjectKey::from_meta(meta).to_string();

        if operation.is_write() {
            info!(kind = %kind, name = %name, operation = %operation, "Successfully created or updated");
        } else {
            debug!(kind = %kind, name = %name, operation = %operation, "Already converged");
        }
        self.metrics.observe_operation(&kind, &operation.to_string());

        ObjectOutcome {
            kind,
            name,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::clients::{MemoryResourceClient, Verb};
    use crate::crd::{ClusterVersionSpec, ClusterVersionStatus, Release};
    use crate::csi::{
        cephfs_driver_name, rbd_driver_name, CsiConfig, SidecarCatalog, CEPHFS_DAEMONSET_NAME,
        CEPHFS_DEPLOYMENT_NAME, ENCRYPTION_CONFIG_MAP_NAME, MONITOR_CONFIG_MAP_NAME,
        RBD_DAEMONSET_NAME, RBD_DEPLOYMENT_NAME, SCC_NAME,
    };
    use crate::domain::ports::{SidecarImages, TemplateFactory};
    use crate::error::ErrorAction;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    const NS: &str = "storage-client";
    const OPERATOR: &str = "storage-client-operator";

    struct Harness {
        client: Arc<MemoryResourceClient>,
        reconciler: Arc<Reconciler>,
        parent: Deployment,
    }

    impl Harness {
        fn new(version: &str) -> Self {
            Self::with_templates(version, Arc::new(CsiConfig::default()))
        }

        fn with_templates(version: &str, templates: TemplateFactoryRef) -> Self {
            let client = Arc::new(MemoryResourceClient::new());
            client.seed(&cluster_version(version)).unwrap();
            let parent = client
                .seed(&Deployment {
                    metadata: ObjectMeta {
                        name: Some(OPERATOR.into()),
                        namespace: Some(NS.into()),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .unwrap();

            let reconciler = Reconciler::new(
                ReconcilerConfig {
                    namespace: NS.into(),
                    ..Default::default()
                },
                client.clone(),
                Owner::from_resource(&parent).unwrap(),
                Arc::new(SidecarCatalog::default()),
                templates,
            )
            .unwrap();

            Self {
                client,
                reconciler,
                parent,
            }
        }

        async fn reconcile(&self) -> Result<ReconcileReport> {
            self.reconciler.reconcile(&ObjectKey::cluster("version")).await
        }
    }

    fn cluster_version(version: &str) -> ClusterVersion {
        let mut cv = ClusterVersion::new("version", ClusterVersionSpec::default());
        cv.status = Some(ClusterVersionStatus {
            desired: Release {
                version: version.into(),
                ..Default::default()
            },
            ..Default::default()
        });
        cv
    }

    /// Builds the stock templates and remembers the images of every pass
    struct RecordingTemplates {
        config: CsiConfig,
        images: Mutex<Vec<SidecarImages>>,
    }

    impl TemplateFactory for RecordingTemplates {
        fn templates(&self, images: SidecarImages) -> Box<dyn TemplateProvider> {
            self.images.lock().push(images.clone());
            self.config.templates(images)
        }
    }

    fn ns_key(name: &str) -> ObjectKey {
        ObjectKey::namespaced(NS, name)
    }

    fn controller_uid(refs: &Option<Vec<OwnerReference>>) -> Option<String> {
        refs.as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
            .map(|r| r.uid.clone())
    }

    #[tokio::test]
    async fn test_empty_cluster_converges_to_nine_objects() {
        let h = Harness::new("4.13.2");

        let report = h.reconcile().await.unwrap();

        assert_eq!(report.version, "4.13.2");
        assert_eq!(report.outcomes.len(), 9);
        assert!(report.outcomes.iter().all(|o| o.operation == Operation::Created));
        assert_eq!(report.writes(), 9);
        assert_eq!(h.client.write_count(), 9);
        // Nine managed objects next to the signal and the operator deployment
        assert_eq!(h.client.len(), 11);

        for name in [MONITOR_CONFIG_MAP_NAME, ENCRYPTION_CONFIG_MAP_NAME] {
            let cm: ConfigMap = h.client.get_typed(&ns_key(name)).unwrap();
            assert_eq!(
                cm.data.unwrap(),
                BTreeMap::from([("config.json".to_string(), "[]".to_string())])
            );
        }

        let deployment: Deployment = h.client.get_typed(&ns_key(RBD_DEPLOYMENT_NAME)).unwrap();
        let images: Vec<_> = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .filter_map(|c| c.image)
            .collect();
        assert!(images.contains(&"registry.k8s.io/sig-storage/csi-provisioner:v3.4.0".to_string()));

        assert!(h
            .client
            .get_typed::<SecurityContextConstraints>(&ObjectKey::cluster(SCC_NAME))
            .is_some());
        for name in [cephfs_driver_name(NS), rbd_driver_name(NS)] {
            assert!(h.client.get_typed::<CSIDriver>(&ObjectKey::cluster(name)).is_some());
        }
        assert_eq!(h.reconciler.metrics().reconciliations("success"), 1);
    }

    #[tokio::test]
    async fn test_second_pass_on_converged_cluster_writes_nothing() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();
        h.client.clear_writes();

        let report = h.reconcile().await.unwrap();

        assert_eq!(report.writes(), 0);
        assert_eq!(h.client.write_count(), 0);
        assert_eq!(
            report.operation("SecurityContextConstraints", SCC_NAME),
            Some(Operation::Unchanged)
        );
        assert_eq!(
            report.operation("ConfigMap", &ns_key(MONITOR_CONFIG_MAP_NAME).to_string()),
            Some(Operation::AlreadyPresent)
        );
        assert_eq!(
            report.operation("CSIDriver", &rbd_driver_name(NS)),
            Some(Operation::AlreadyPresent)
        );
    }

    #[tokio::test]
    async fn test_user_edits_to_config_maps_survive() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();

        let user_content = r#"[{"clusterID":"a","monitors":["10.0.0.1:6789"]}]"#;
        h.client
            .modify::<ConfigMap, _>(&ns_key(MONITOR_CONFIG_MAP_NAME), |cm| {
                cm.data = Some(BTreeMap::from([(
                    "config.json".to_string(),
                    user_content.to_string(),
                )]));
            })
            .unwrap();

        h.reconcile().await.unwrap();

        let cm: ConfigMap = h.client.get_typed(&ns_key(MONITOR_CONFIG_MAP_NAME)).unwrap();
        assert_eq!(cm.data.unwrap()["config.json"], user_content);
    }

    #[tokio::test]
    async fn test_config_maps_are_not_owned() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();

        for name in [MONITOR_CONFIG_MAP_NAME, ENCRYPTION_CONFIG_MAP_NAME] {
            let cm: ConfigMap = h.client.get_typed(&ns_key(name)).unwrap();
            assert!(cm.metadata.owner_references.is_none());
        }
    }

    #[tokio::test]
    async fn test_security_policy_tolerates_external_touch() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();
        let key = ObjectKey::cluster(SCC_NAME);

        h.client.touch::<SecurityContextConstraints>(&key).unwrap();
        let touched: SecurityContextConstraints = h.client.get_typed(&key).unwrap();
        h.client.clear_writes();

        let report = h.reconcile().await.unwrap();

        let after: SecurityContextConstraints = h.client.get_typed(&key).unwrap();
        assert_eq!(
            report.operation("SecurityContextConstraints", SCC_NAME),
            Some(Operation::Unchanged)
        );
        assert_eq!(after.metadata.resource_version, touched.metadata.resource_version);
        assert_eq!(h.client.write_count(), 0);
    }

    #[tokio::test]
    async fn test_security_policy_drift_is_corrected() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();
        let key = ObjectKey::cluster(SCC_NAME);

        let drifted = h
            .client
            .modify::<SecurityContextConstraints, _>(&key, |scc| {
                scc.allow_host_network = false;
                scc.users.clear();
            })
            .unwrap();

        let report = h.reconcile().await.unwrap();

        let after: SecurityContextConstraints = h.client.get_typed(&key).unwrap();
        assert_eq!(
            report.operation("SecurityContextConstraints", SCC_NAME),
            Some(Operation::Updated)
        );
        assert!(after.allow_host_network);
        assert_eq!(after.users.len(), 4);
        assert_eq!(after.metadata.uid, drifted.metadata.uid);
        assert_ne!(after.metadata.resource_version, drifted.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_workload_drift_is_corrected() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();

        h.client
            .modify::<Deployment, _>(&ns_key(CEPHFS_DEPLOYMENT_NAME), |d| {
                if let Some(spec) = d.spec.as_mut() {
                    spec.replicas = Some(7);
                }
            })
            .unwrap();

        let report = h.reconcile().await.unwrap();

        let deployment: Deployment = h.client.get_typed(&ns_key(CEPHFS_DEPLOYMENT_NAME)).unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(2));
        assert_eq!(report.writes(), 1);
    }

    #[tokio::test]
    async fn test_owner_deletion_collects_only_workloads() {
        let h = Harness::new("4.13.2");
        h.reconcile().await.unwrap();

        let parent_uid = h.parent.metadata.uid.clone();
        for name in [CEPHFS_DEPLOYMENT_NAME, RBD_DEPLOYMENT_NAME] {
            let d: Deployment = h.client.get_typed(&ns_key(name)).unwrap();
            assert_eq!(controller_uid(&d.metadata.owner_references), parent_uid);
        }
        for name in [CEPHFS_DAEMONSET_NAME, RBD_DAEMONSET_NAME] {
            let ds: DaemonSet = h.client.get_typed(&ns_key(name)).unwrap();
            assert_eq!(controller_uid(&ds.metadata.owner_references), parent_uid);
        }

        h.client.delete::<Deployment>(&ns_key(OPERATOR)).unwrap();
        assert_eq!(h.client.collect_garbage(), 4);

        assert!(h.client.get_typed::<Deployment>(&ns_key(RBD_DEPLOYMENT_NAME)).is_none());
        assert!(h.client.get_typed::<DaemonSet>(&ns_key(CEPHFS_DAEMONSET_NAME)).is_none());
        assert!(h
            .client
            .get_typed::<SecurityContextConstraints>(&ObjectKey::cluster(SCC_NAME))
            .is_some());
        for name in [cephfs_driver_name(NS), rbd_driver_name(NS)] {
            assert!(h.client.get_typed::<CSIDriver>(&ObjectKey::cluster(name)).is_some());
        }
    }

    #[tokio::test]
    async fn test_partial_workload_failure_recovers_on_rerun() {
        let h = Harness::new("4.13.2");
        h.client.fail_next(
            Verb::Create,
            "DaemonSet",
            CEPHFS_DAEMONSET_NAME,
            Error::Transport("connection reset".into()),
        );

        let err = h.reconcile().await.unwrap_err();
        assert_matches!(err, Error::Transport(_));
        assert!(err.is_retryable());
        // Driver registration comes after the failing phase
        assert!(h
            .client
            .get_typed::<CSIDriver>(&ObjectKey::cluster(rbd_driver_name(NS)))
            .is_none());
        assert!(h
            .client
            .get_typed::<Deployment>(&ns_key(CEPHFS_DEPLOYMENT_NAME))
            .is_some());

        let report = h.reconcile().await.unwrap();

        assert_eq!(
            report.operation("Deployment", &ns_key(CEPHFS_DEPLOYMENT_NAME).to_string()),
            Some(Operation::Unchanged)
        );
        assert_eq!(
            report.operation("DaemonSet", &ns_key(CEPHFS_DAEMONSET_NAME).to_string()),
            Some(Operation::Created)
        );
        assert!(h.client.get_typed::<DaemonSet>(&ns_key(CEPHFS_DAEMONSET_NAME)).is_some());
        assert!(h
            .client
            .get_typed::<CSIDriver>(&ObjectKey::cluster(rbd_driver_name(NS)))
            .is_some());
        assert_eq!(h.reconciler.metrics().reconciliations("failure"), 1);
    }

    #[tokio::test]
    async fn test_update_conflict_aborts_pass_with_backoff() {
        let h = Harness::new("4.13.2");
        h.client
            .seed(&Deployment {
                metadata: ObjectMeta {
                    name: Some(CEPHFS_DEPLOYMENT_NAME.into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        h.client.fail_next(
            Verb::Update,
            "Deployment",
            CEPHFS_DEPLOYMENT_NAME,
            Error::Conflict {
                kind: "Deployment".into(),
                name: ns_key(CEPHFS_DEPLOYMENT_NAME).to_string(),
            },
        );

        let err = h.reconcile().await.unwrap_err();

        assert_matches!(err, Error::Conflict { .. });
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert!(h
            .client
            .get_typed::<CSIDriver>(&ObjectKey::cluster(cephfs_driver_name(NS)))
            .is_none());

        let report = h.reconcile().await.unwrap();

        assert_eq!(
            report.operation("Deployment", &ns_key(CEPHFS_DEPLOYMENT_NAME).to_string()),
            Some(Operation::Updated)
        );
        let deployment: Deployment = h.client.get_typed(&ns_key(CEPHFS_DEPLOYMENT_NAME)).unwrap();
        assert_eq!(
            controller_uid(&deployment.metadata.owner_references),
            h.parent.metadata.uid
        );
    }

    #[tokio::test]
    async fn test_concurrent_workload_failures_are_aggregated() {
        let h = Harness::new("4.13.2");
        h.client.fail_next(
            Verb::Get,
            "Deployment",
            CEPHFS_DEPLOYMENT_NAME,
            Error::Transport("timeout".into()),
        );
        h.client.fail_next(
            Verb::Create,
            "DaemonSet",
            RBD_DAEMONSET_NAME,
            Error::Transport("connection reset".into()),
        );

        let err = h.reconcile().await.unwrap_err();

        assert_matches!(err, Error::Aggregate(ref errors) if errors.len() == 2);
        assert!(h.client.get_typed::<DaemonSet>(&ns_key(CEPHFS_DAEMONSET_NAME)).is_some());
        assert!(h.client.get_typed::<Deployment>(&ns_key(RBD_DEPLOYMENT_NAME)).is_some());
    }

    #[tokio::test]
    async fn test_sidecar_failure_touches_nothing() {
        let h = Harness::new("3.11.0");

        let err = h.reconcile().await.unwrap_err();

        assert_matches!(err, Error::UnsupportedPlatformVersion { .. });
        assert_eq!(h.client.write_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_without_desired_version_fails() {
        let h = Harness::new("");

        assert_matches!(h.reconcile().await, Err(Error::SignalInvalid(_)));
        assert_eq!(h.client.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_signal_fails() {
        let h = Harness::new("4.13.2");

        let err = h
            .reconciler
            .reconcile(&ObjectKey::cluster("other"))
            .await
            .unwrap_err();

        assert_matches!(err, Error::ResourceNotFound { .. });
        assert_eq!(h.client.write_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_controller_fails_reconcile() {
        let h = Harness::new("4.13.2");
        h.client
            .seed(&Deployment {
                metadata: ObjectMeta {
                    name: Some(RBD_DEPLOYMENT_NAME.into()),
                    namespace: Some(NS.into()),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "apps/v1".into(),
                        kind: "Deployment".into(),
                        name: "another-operator".into(),
                        uid: "foreign-uid".into(),
                        controller: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let err = h.reconcile().await.unwrap_err();

        assert_matches!(err, Error::AlreadyOwned { .. });
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_workload_left_by_recreated_operator_is_adopted() {
        let h = Harness::new("4.13.2");
        h.client
            .seed(&Deployment {
                metadata: ObjectMeta {
                    name: Some(RBD_DEPLOYMENT_NAME.into()),
                    namespace: Some(NS.into()),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "apps/v1".into(),
                        kind: "Deployment".into(),
                        name: OPERATOR.into(),
                        uid: "previous-operator-uid".into(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let report = h.reconcile().await.unwrap();

        assert_eq!(
            report.operation("Deployment", &ns_key(RBD_DEPLOYMENT_NAME).to_string()),
            Some(Operation::Updated)
        );
        let deployment: Deployment = h.client.get_typed(&ns_key(RBD_DEPLOYMENT_NAME)).unwrap();
        let refs = deployment.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(Some(refs[0].uid.clone()), h.parent.metadata.uid);
    }

    #[tokio::test]
    async fn test_injected_templates_are_built_once_per_pass() {
        let factory = Arc::new(RecordingTemplates {
            config: CsiConfig {
                plugin_image: "mirror.local/cephcsi:test".into(),
                ..Default::default()
            },
            images: Mutex::new(Vec::new()),
        });
        let h = Harness::with_templates("4.12.5", factory.clone());

        h.reconcile().await.unwrap();
        h.reconcile().await.unwrap();

        let images = factory.images.lock().clone();
        assert_eq!(images.len(), 2);
        assert_eq!(
            images[0].provisioner,
            "registry.k8s.io/sig-storage/csi-provisioner:v3.3.0"
        );

        let daemonset: DaemonSet = h.client.get_typed(&ns_key(RBD_DAEMONSET_NAME)).unwrap();
        let plugin_images: Vec<_> = daemonset
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .filter_map(|c| c.image)
            .collect();
        assert!(plugin_images.contains(&"mirror.local/cephcsi:test".to_string()));
    }

    #[test]
    fn test_rejects_empty_namespace() {
        let client = Arc::new(MemoryResourceClient::new());
        let parent = client
            .seed(&Deployment {
                metadata: ObjectMeta {
                    name: Some(OPERATOR.into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let result = Reconciler::new(
            ReconcilerConfig {
                namespace: String::new(),
                ..Default::default()
            },
            client,
            Owner::from_resource(&parent).unwrap(),
            Arc::new(SidecarCatalog::default()),
            Arc::new(CsiConfig::default()),
        );
        assert_matches!(result.err(), Some(Error::Configuration(_)));
    }
}
