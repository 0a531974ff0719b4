//! SecurityContextConstraints
//!
//! Cluster-scoped pod admission policy. Unlike most kinds its fields sit at
//! the top level of the object instead of under `spec`, so the resource
//! binding is written out by hand rather than derived.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

// =============================================================================
// SecurityContextConstraints
// =============================================================================

/// Security policy granted to the service accounts of the CSI pods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConstraints {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default)]
    pub allow_privileged_container: bool,

    #[serde(default)]
    pub allow_host_dir_volume_plugin: bool,

    #[serde(default, rename = "allowHostIPC")]
    pub allow_host_ipc: bool,

    #[serde(default)]
    pub allow_host_network: bool,

    #[serde(default, rename = "allowHostPID")]
    pub allow_host_pid: bool,

    #[serde(default)]
    pub allow_host_ports: bool,

    #[serde(default)]
    pub read_only_root_filesystem: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_drop_capabilities: Vec<String>,

    #[serde(default)]
    pub run_as_user: StrategyOptions,

    #[serde(default, rename = "seLinuxContext")]
    pub se_linux_context: StrategyOptions,

    #[serde(default)]
    pub fs_group: StrategyOptions,

    #[serde(default)]
    pub supplemental_groups: StrategyOptions,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Strategy selector shared by the user, SELinux, fsGroup and
/// supplemental-group sections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyOptions {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl StrategyOptions {
    pub fn run_as_any() -> Self {
        Self {
            strategy: Some("RunAsAny".to_string()),
        }
    }
}

impl Resource for SecurityContextConstraints {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("SecurityContextConstraints")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("security.openshift.io")
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("v1")
    }

    fn api_version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("security.openshift.io/v1")
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("securitycontextconstraints")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
