//! CSI Sidecar Selection
//!
//! Picks the sidecar container images matching the platform release the
//! cluster is moving to.

use crate::domain::ports::{SidecarImages, SidecarInitializer};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Image tags of one sidecar generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarTags {
    pub provisioner: &'static str,
    pub attacher: &'static str,
    pub resizer: &'static str,
    pub snapshotter: &'static str,
    pub registrar: &'static str,
}

/// Platform major version the catalog covers
const SUPPORTED_MAJOR: u32 = 4;

/// Sidecar generations keyed by the minimum platform minor version
fn default_generations() -> BTreeMap<u32, SidecarTags> {
    BTreeMap::from([
        (
            11,
            SidecarTags {
                provisioner: "v3.2.1",
                attacher: "v3.5.0",
                resizer: "v1.5.0",
                snapshotter: "v6.0.1",
                registrar: "v2.5.1",
            },
        ),
        (
            12,
            SidecarTags {
                provisioner: "v3.3.0",
                attacher: "v4.0.0",
                resizer: "v1.6.0",
                snapshotter: "v6.1.0",
                registrar: "v2.6.2",
            },
        ),
        (
            13,
            SidecarTags {
                provisioner: "v3.4.0",
                attacher: "v4.1.0",
                resizer: "v1.7.0",
                snapshotter: "v6.2.1",
                registrar: "v2.7.0",
            },
        ),
    ])
}

/// Version-indexed sidecar catalog
#[derive(Debug, Clone)]
pub struct SidecarCatalog {
    registry: String,
    generations: BTreeMap<u32, SidecarTags>,
}

impl Default for SidecarCatalog {
    fn default() -> Self {
        Self::new("registry.k8s.io/sig-storage")
    }
}

impl SidecarCatalog {
    /// Catalog pulling sidecars from `registry`
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            generations: default_generations(),
        }
    }

    fn image(&self, name: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.registry, name, tag)
    }
}

/// Parse `major.minor` out of a release version such as `4.13.2` or
/// `4.14.0-rc.1`.
fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

impl SidecarInitializer for SidecarCatalog {
    fn initialize(&self, version: &str) -> Result<SidecarImages> {
        let unsupported = || Error::UnsupportedPlatformVersion {
            version: version.to_string(),
        };

        let (major, minor) = parse_major_minor(version).ok_or_else(unsupported)?;
        if major != SUPPORTED_MAJOR {
            return Err(unsupported());
        }

        // Newest generation not newer than the release
        let (generation, tags) = self
            .generations
            .range(..=minor)
            .next_back()
            .ok_or_else(unsupported)?;
        debug!(version, generation, "Selected sidecar generation");

        let images = SidecarImages {
            provisioner: self.image("csi-provisioner", tags.provisioner),
            attacher: self.image("csi-attacher", tags.attacher),
            resizer: self.image("csi-resizer", tags.resizer),
            snapshotter: self.image("csi-snapshotter", tags.snapshotter),
            registrar: self.image("csi-node-driver-registrar", tags.registrar),
        };
        info!(version, provisioner = %images.provisioner, "Initialized CSI sidecars");

        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_major_minor() {
        assert_eq!(parse_major_minor("4.13.2"), Some((4, 13)));
        assert_eq!(parse_major_minor("4.14.0-rc.1"), Some((4, 14)));
        assert_eq!(parse_major_minor("v4.12"), Some((4, 12)));
        assert_eq!(parse_major_minor("4"), None);
        assert_eq!(parse_major_minor(""), None);
        assert_eq!(parse_major_minor("four.twelve"), None);
    }

    #[test]
    fn test_selects_exact_generation() {
        let images = SidecarCatalog::default().initialize("4.12.7").unwrap();
        assert_eq!(
            images.provisioner,
            "registry.k8s.io/sig-storage/csi-provisioner:v3.3.0"
        );
        assert_eq!(
            images.registrar,
            "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.6.2"
        );
    }

    #[test]
    fn test_newer_release_uses_latest_generation() {
        let images = SidecarCatalog::new("mirror.local/csi").initialize("4.16.0").unwrap();
        assert_eq!(images.attacher, "mirror.local/csi/csi-attacher:v4.1.0");
    }

    #[test]
    fn test_rejects_unsupported_versions() {
        let catalog = SidecarCatalog::default();
        assert_matches!(
            catalog.initialize("4.10.3"),
            Err(Error::UnsupportedPlatformVersion { .. })
        );
        assert_matches!(
            catalog.initialize("5.0.0"),
            Err(Error::UnsupportedPlatformVersion { .. })
        );
        assert_matches!(
            catalog.initialize("latest"),
            Err(Error::UnsupportedPlatformVersion { .. })
        );
    }
}
