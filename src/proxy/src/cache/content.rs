use crate::cache::metadata::ManifestDocument;
use crate::cache::storage::{remove_if_exists, CacheStorage};
use crate::error::Result;
use cachedimage::{ImageReference, Reference};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Index children are manifests; nesting deeper than this is not followed
const MAX_MANIFEST_DEPTH: usize = 2;

/// Cache files that make up one image
#[derive(Debug, Default, Clone)]
pub struct ImageContent {
    pub files: BTreeSet<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed_files: usize,
    pub freed_bytes: u64,
}

impl CacheStorage {
    /// Collect the tag pointer, manifests (index children included) and
    /// blobs cached for `image`
    pub async fn content_of(&self, image: &ImageReference) -> Result<ImageContent> {
        let mut content = ImageContent::default();

        let root = match &image.reference {
            Reference::Digest(digest) => Some(digest.clone()),
            Reference::Tag(tag) => {
                let path = self.tag_path(image, tag);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    content.files.insert(path);
                }
                self.resolve_tag(image, tag).await?
            }
        };

        let mut pending: Vec<(String, usize)> = root.into_iter().map(|d| (d, 0)).collect();
        let mut seen = BTreeSet::new();

        while let Some((digest, depth)) = pending.pop() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let Some(manifest) = self.read_manifest(image, &digest).await? else {
                continue;
            };
            content.files.insert(self.manifest_path(image, &digest)?);
            let meta_path = self.manifest_meta_path(image, &digest)?;
            if tokio::fs::try_exists(&meta_path).await.unwrap_or(false) {
                content.files.insert(meta_path);
            }

            let doc = match ManifestDocument::parse(&manifest.body) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::debug!(image = %image, digest = %digest, error = %e, "Unparseable cached manifest");
                    continue;
                }
            };

            if depth < MAX_MANIFEST_DEPTH {
                pending.extend(doc.manifests.iter().map(|child| (child.digest.clone(), depth + 1)));
            }
            for blob in doc.blob_digests() {
                // Foreign digest algorithms are never cached
                let Ok(path) = self.blob_path(blob) else {
                    continue;
                };
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    content.files.insert(path);
                }
            }
        }

        Ok(content)
    }

    /// Remove the cached content of `expired` that none of `survivors` reaches
    pub async fn evict_unreferenced(
        &self,
        expired: &ImageReference,
        survivors: &[ImageReference],
    ) -> Result<EvictionReport> {
        let mut candidates = self.content_of(expired).await?.files;
        if candidates.is_empty() {
            return Ok(EvictionReport::default());
        }

        for survivor in survivors {
            if survivor == expired {
                continue;
            }
            for file in self.content_of(survivor).await?.files {
                candidates.remove(&file);
            }
            if candidates.is_empty() {
                break;
            }
        }

        let mut report = EvictionReport::default();
        for file in &candidates {
            let size = tokio::fs::metadata(file).await.map(|m| m.len()).unwrap_or(0);
            if remove_if_exists(file).await? {
                report.removed_files += 1;
                report.freed_bytes += size;
            }
        }

        tracing::info!(
            image = %expired,
            removed_files = report.removed_files,
            freed_bytes = report.freed_bytes,
            "Evicted cached image content"
        );
        Ok(report)
    }
}
