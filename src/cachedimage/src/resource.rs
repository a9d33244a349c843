use crate::reference::ImageReference;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// One CachedImage per distinct image reference, cluster scoped.
// Example:
// apiVersion: kuik.enix.io/v1alpha1
// kind: CachedImage
// metadata:
//   name: docker.io-library-nginx-1.25-3f2a9c0d41be
// spec:
//   sourceImage: docker.io/library/nginx:1.25
// status:
//   phase: Cached
//   owners:
//   - namespace: default
//     name: web-7d9f
//   digest: sha256:...
//   cachedAt: 2026-01-01T00:00:00Z

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kuik.enix.io",
    version = "v1alpha1",
    kind = "CachedImage",
    plural = "cachedimages",
    shortname = "ci",
    status = "CachedImageStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.sourceImage"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageSpec {
    /// Canonical image reference (registry/repository:tag or @digest)
    pub source_image: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ImagePhase {
    /// Known to the cluster but not resolved through the proxy yet
    #[default]
    Pending,
    /// Manifest resolved and present in the cache
    Cached,
    /// Repeated upstream failures with nothing cached
    Error,
    /// Unreferenced past the expiry delay, about to be deleted
    Expired,
}

impl fmt::Display for ImagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagePhase::Pending => write!(f, "Pending"),
            ImagePhase::Cached => write!(f, "Cached"),
            ImagePhase::Error => write!(f, "Error"),
            ImagePhase::Expired => write!(f, "Expired"),
        }
    }
}

/// A pod using an image
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct PodReference {
    pub namespace: String,
    pub name: String,
}

impl PodReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageStatus {
    #[serde(default)]
    pub phase: ImagePhase,
    /// Pods currently running this image
    #[serde(default)]
    pub owners: BTreeSet<PodReference>,
    /// Last time the owner set changed while the image was in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    /// Deletion deadline, only set while the owner set is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// First successful resolution through the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    /// Last pull served by the proxy. Does not affect expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Manifest digest last resolved by the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub upstream_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CachedImage {
    /// A new record for `image`, named after its canonical form
    pub fn for_reference(image: &ImageReference) -> Self {
        CachedImage::new(
            &image.resource_name(),
            CachedImageSpec {
                source_image: image.to_string(),
            },
        )
    }

    pub fn source(&self) -> Option<ImageReference> {
        ImageReference::parse(&self.spec.source_image).ok()
    }

    pub fn phase(&self) -> ImagePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn has_owner(&self, pod: &PodReference) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.owners.contains(pod))
    }
}
