//! ClusterVersion
//!
//! The platform's cluster-scoped version singleton. The operator only reads
//! it: every change to it triggers a convergence pass, and its desired
//! version selects the CSI sidecar images.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// ClusterVersion
// =============================================================================

/// ClusterVersion describes the version the platform is running and the
/// version it is moving towards.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterVersion",
    plural = "clusterversions",
    status = "ClusterVersionStatus",
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".status.desired.version"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    /// Unique identifier of the cluster
    #[serde(default)]
    pub cluster_id: String,

    /// Update channel the cluster follows
    #[serde(default)]
    pub channel: Option<String>,

    /// Update server consulted for available updates
    #[serde(default)]
    pub upstream: Option<String>,

    /// Release the administrator asked for
    #[serde(default)]
    pub desired_update: Option<Release>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// A platform release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Semantic version, e.g. `4.13.2`
    #[serde(default)]
    pub version: String,

    /// Release payload image
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub channels: Vec<String>,
}

/// Entry of the update history
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHistory {
    /// `Completed` or `Partial`
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub started_time: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completion_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the ClusterVersion
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    /// Release the cluster is reconciling towards
    #[serde(default)]
    pub desired: Release,

    /// Most recent updates first
    #[serde(default)]
    pub history: Vec<UpdateHistory>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub version_hash: String,
}

impl ClusterVersion {
    /// Desired platform version, if the status carries a non-empty one
    pub fn desired_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.desired.version.as_str())
            .filter(|version| !version.is_empty())
    }
}
