use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manifest metadata stored alongside cached manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub digest: String,
    pub content_type: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

/// A manifest body together with the metadata it is served with
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub body: Bytes,
    pub metadata: ManifestMetadata,
}

/// The parts of a manifest or image index the cache needs to follow.
///
/// Covers Docker schema 2 manifests and manifest lists, OCI manifests and
/// indexes, and the `fsLayers` of schema 1.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

impl ManifestDocument {
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn is_index(&self) -> bool {
        !self.manifests.is_empty()
    }

    /// Config and layer digests referenced by a single-platform manifest
    pub fn blob_digests(&self) -> Vec<&str> {
        let mut digests: Vec<&str> = Vec::new();
        if let Some(config) = &self.config {
            digests.push(&config.digest);
        }
        digests.extend(self.layers.iter().map(|l| l.digest.as_str()));
        digests.extend(self.fs_layers.iter().map(|l| l.blob_sum.as_str()));
        digests.sort_unstable();
        digests.dedup();
        digests
    }

    /// Child manifest of an index matching `platform` (`os/arch[/variant]`)
    pub fn child_for_platform(&self, platform: &str) -> Option<&Descriptor> {
        let mut parts = platform.split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next();

        self.manifests.iter().find(|child| match &child.platform {
            Some(p) => {
                p.os == os
                    && p.architecture == arch
                    && variant.is_none_or(|v| p.variant.as_deref() == Some(v))
            }
            None => false,
        })
    }

    /// Media type declared inside the document, used when none was recorded
    pub fn declared_media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }
}
