//! CSI Object Templates
//!
//! Desired state of every object in the CSI bundle. Templates are pure:
//! given the same configuration, sidecar images and namespace they always
//! produce the same objects.

use super::{
    cephfs_driver_name, rbd_driver_name, CEPHFS_DAEMONSET_NAME, CEPHFS_DEPLOYMENT_NAME,
    ENCRYPTION_CONFIG_MAP_NAME, MONITOR_CONFIG_MAP_NAME, RBD_DAEMONSET_NAME, RBD_DEPLOYMENT_NAME,
    SCC_NAME,
};
use crate::crd::{SecurityContextConstraints, StrategyOptions};
use crate::domain::ports::{SidecarImages, TemplateFactory, TemplateProvider};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
    DeploymentStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Seed content of the user-owned config maps
pub const SEED_CONFIG_KEY: &str = "config.json";
pub const SEED_CONFIG_VALUE: &str = "[]";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of the CSI templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiConfig {
    /// Ceph CSI plugin image
    pub plugin_image: String,
    /// Kubelet root directory on the nodes
    pub kubelet_dir: String,
    /// Replicas of each provisioner deployment
    pub provisioner_replicas: i32,
}

impl Default for CsiConfig {
    fn default() -> Self {
        Self {
            plugin_image: "quay.io/cephcsi/cephcsi:v3.9.0".to_string(),
            kubelet_dir: "/var/lib/kubelet".to_string(),
            provisioner_replicas: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driver {
    CephFs,
    Rbd,
}

impl Driver {
    fn plugin_type(self) -> &'static str {
        match self {
            Driver::CephFs => "cephfs",
            Driver::Rbd => "rbd",
        }
    }

    fn driver_name(self, namespace: &str) -> String {
        match self {
            Driver::CephFs => cephfs_driver_name(namespace),
            Driver::Rbd => rbd_driver_name(namespace),
        }
    }

    fn provisioner_service_account(self) -> String {
        format!("ceph-csi-{}-provisioner-sa", self.plugin_type())
    }

    fn plugin_service_account(self) -> String {
        format!("ceph-csi-{}-plugin-sa", self.plugin_type())
    }
}

// =============================================================================
// CSI Templates
// =============================================================================

impl TemplateFactory for CsiConfig {
    fn templates(&self, images: SidecarImages) -> Box<dyn TemplateProvider> {
        Box::new(CsiTemplates::new(self.clone(), images))
    }
}

/// Template provider for the Ceph CSI bundle
#[derive(Debug, Clone)]
pub struct CsiTemplates {
    config: CsiConfig,
    images: SidecarImages,
}

impl CsiTemplates {
    pub fn new(config: CsiConfig, images: SidecarImages) -> Self {
        Self { config, images }
    }

    fn meta(name: &str, namespace: Option<&str>, app: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(app_labels(app)),
            ..Default::default()
        }
    }

    fn seed_config_map(name: &str, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                SEED_CONFIG_KEY.to_string(),
                SEED_CONFIG_VALUE.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn plugin_container(&self, driver: Driver, namespace: &str, server: &str) -> Container {
        Container {
            name: format!("csi-{}plugin", driver.plugin_type()),
            image: Some(self.config.plugin_image.clone()),
            args: Some(vec![
                format!("--type={}", driver.plugin_type()),
                format!("--{}=true", server),
                "--endpoint=$(CSI_ENDPOINT)".to_string(),
                "--nodeid=$(NODE_ID)".to_string(),
                format!("--drivername={}", driver.driver_name(namespace)),
                "--pidlimit=-1".to_string(),
                "--v=5".to_string(),
            ]),
            env: Some(vec![
                field_env("NODE_ID", "spec.nodeName"),
                field_env("POD_NAMESPACE", "metadata.namespace"),
                EnvVar {
                    name: "CSI_ENDPOINT".to_string(),
                    value: Some("unix:///csi/csi.sock".to_string()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![
                mount("socket-dir", "/csi"),
                mount("ceph-csi-configs", "/etc/ceph-csi-config/"),
                mount("ceph-csi-kms-config", "/etc/ceph-csi-encryption-kms-config/"),
                mount("keys-tmp-dir", "/tmp/csi/keys"),
            ]),
            security_context: Some(privileged()),
            ..Default::default()
        }
    }

    fn sidecar(&self, name: &str, image: &str, extra_args: &[&str]) -> Container {
        let mut args = vec![
            "--csi-address=$(ADDRESS)".to_string(),
            "--v=5".to_string(),
            "--timeout=150s".to_string(),
            "--leader-election=true".to_string(),
        ];
        args.extend(extra_args.iter().map(|a| a.to_string()));

        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            args: Some(args),
            env: Some(vec![EnvVar {
                name: "ADDRESS".to_string(),
                value: Some("unix:///csi/csi.sock".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
            ..Default::default()
        }
    }

    fn provisioner(&self, driver: Driver, name: &str, namespace: &str) -> Deployment {
        let mut containers = vec![
            self.sidecar(
                "csi-provisioner",
                &self.images.provisioner,
                &["--retry-interval-start=500ms", "--extra-create-metadata=true"],
            ),
            self.sidecar("csi-resizer", &self.images.resizer, &["--handle-volume-inuse-error=false"]),
            self.sidecar("csi-snapshotter", &self.images.snapshotter, &["--extra-create-metadata=true"]),
        ];
        if driver == Driver::Rbd {
            containers.push(self.sidecar("csi-attacher", &self.images.attacher, &[]));
        }
        containers.push(self.plugin_container(driver, namespace, "controllerserver"));

        Deployment {
            metadata: Self::meta(name, Some(namespace), name),
            spec: Some(DeploymentSpec {
                replicas: Some(self.config.provisioner_replicas),
                selector: selector(name),
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels(name)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(driver.provisioner_service_account()),
                        priority_class_name: Some("system-cluster-critical".to_string()),
                        containers,
                        volumes: Some(vec![
                            empty_dir("socket-dir"),
                            empty_dir("keys-tmp-dir"),
                            config_map_volume("ceph-csi-configs", MONITOR_CONFIG_MAP_NAME),
                            config_map_volume("ceph-csi-kms-config", ENCRYPTION_CONFIG_MAP_NAME),
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_plugin(&self, driver: Driver, name: &str, namespace: &str) -> DaemonSet {
        let driver_name = driver.driver_name(namespace);
        let kubelet = &self.config.kubelet_dir;
        let plugin_dir = format!("{}/plugins/{}", kubelet, driver_name);

        let registrar = Container {
            name: "driver-registrar".to_string(),
            image: Some(self.images.registrar.clone()),
            args: Some(vec![
                "--v=5".to_string(),
                "--csi-address=/csi/csi.sock".to_string(),
                format!("--kubelet-registration-path={}/csi.sock", plugin_dir),
            ]),
            volume_mounts: Some(vec![
                mount("plugin-dir", "/csi"),
                mount("registration-dir", "/registration"),
            ]),
            security_context: Some(privileged()),
            ..Default::default()
        };

        let mut plugin = self.plugin_container(driver, namespace, "nodeserver");
        if let Some(mounts) = plugin.volume_mounts.as_mut() {
            mounts.retain(|m| m.name != "socket-dir");
            mounts.push(mount("plugin-dir", "/csi"));
            mounts.push(VolumeMount {
                name: "pods-mount-dir".to_string(),
                mount_path: format!("{}/pods", kubelet),
                mount_propagation: Some("Bidirectional".to_string()),
                ..Default::default()
            });
            mounts.push(mount("host-dev", "/dev"));
            mounts.push(mount("host-sys", "/sys"));
        }

        DaemonSet {
            metadata: Self::meta(name, Some(namespace), name),
            spec: Some(DaemonSetSpec {
                selector: selector(name),
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDaemonSet {
                        max_unavailable: Some(IntOrString::Int(1)),
                        ..Default::default()
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels(name)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(driver.plugin_service_account()),
                        priority_class_name: Some("system-node-critical".to_string()),
                        host_network: Some(true),
                        host_pid: Some(true),
                        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                        containers: vec![registrar, plugin],
                        volumes: Some(vec![
                            host_path("plugin-dir", &plugin_dir, "DirectoryOrCreate"),
                            host_path(
                                "registration-dir",
                                &format!("{}/plugins_registry", kubelet),
                                "Directory",
                            ),
                            host_path("pods-mount-dir", &format!("{}/pods", kubelet), "Directory"),
                            host_path("host-dev", "/dev", ""),
                            host_path("host-sys", "/sys", ""),
                            empty_dir("keys-tmp-dir"),
                            config_map_volume("ceph-csi-configs", MONITOR_CONFIG_MAP_NAME),
                            config_map_volume("ceph-csi-kms-config", ENCRYPTION_CONFIG_MAP_NAME),
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn csi_driver(driver: Driver, namespace: &str) -> CSIDriver {
        CSIDriver {
            metadata: ObjectMeta {
                name: Some(driver.driver_name(namespace)),
                ..Default::default()
            },
            spec: CSIDriverSpec {
                attach_required: Some(true),
                pod_info_on_mount: Some(false),
                fs_group_policy: Some("File".to_string()),
                ..Default::default()
            },
        }
    }
}

impl TemplateProvider for CsiTemplates {
    fn security_context_constraints(&self, namespace: &str) -> SecurityContextConstraints {
        let users = [
            Driver::CephFs.plugin_service_account(),
            Driver::CephFs.provisioner_service_account(),
            Driver::Rbd.plugin_service_account(),
            Driver::Rbd.provisioner_service_account(),
        ]
        .into_iter()
        .map(|sa| format!("system:serviceaccount:{}:{}", namespace, sa))
        .collect();

        SecurityContextConstraints {
            metadata: Self::meta(SCC_NAME, None, SCC_NAME),
            allow_privileged_container: true,
            allow_host_dir_volume_plugin: true,
            allow_host_ipc: true,
            allow_host_network: true,
            allow_host_pid: true,
            allow_host_ports: true,
            read_only_root_filesystem: false,
            allowed_capabilities: vec!["SYS_ADMIN".to_string()],
            run_as_user: StrategyOptions::run_as_any(),
            se_linux_context: StrategyOptions::run_as_any(),
            fs_group: StrategyOptions::run_as_any(),
            supplemental_groups: StrategyOptions::run_as_any(),
            volumes: ["configMap", "emptyDir", "hostPath", "projected", "secret"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            users,
            ..Default::default()
        }
    }

    fn monitor_config_map(&self, namespace: &str) -> ConfigMap {
        Self::seed_config_map(MONITOR_CONFIG_MAP_NAME, namespace)
    }

    fn encryption_config_map(&self, namespace: &str) -> ConfigMap {
        Self::seed_config_map(ENCRYPTION_CONFIG_MAP_NAME, namespace)
    }

    fn cephfs_deployment(&self, namespace: &str) -> Deployment {
        self.provisioner(Driver::CephFs, CEPHFS_DEPLOYMENT_NAME, namespace)
    }

    fn cephfs_daemonset(&self, namespace: &str) -> DaemonSet {
        self.node_plugin(Driver::CephFs, CEPHFS_DAEMONSET_NAME, namespace)
    }

    fn rbd_deployment(&self, namespace: &str) -> Deployment {
        self.provisioner(Driver::Rbd, RBD_DEPLOYMENT_NAME, namespace)
    }

    fn rbd_daemonset(&self, namespace: &str) -> DaemonSet {
        self.node_plugin(Driver::Rbd, RBD_DAEMONSET_NAME, namespace)
    }

    fn cephfs_csi_driver(&self, namespace: &str) -> CSIDriver {
        Self::csi_driver(Driver::CephFs, namespace)
    }

    fn rbd_csi_driver(&self, namespace: &str) -> CSIDriver {
        Self::csi_driver(Driver::Rbd, namespace)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "storage-client-operator".to_string(),
        ),
    ])
}

fn selector(app: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()).filter(|t| !t.is_empty()),
        }),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}
