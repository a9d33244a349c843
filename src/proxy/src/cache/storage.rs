use crate::cache::filling::{BlobFill, BlobSource, FillProgress};
use crate::cache::metadata::{CachedManifest, ManifestDocument, ManifestMetadata};
use crate::cache::singleflight::SingleFlight;
use crate::config::DEFAULT_MANIFEST_MEDIA_TYPE;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use cachedimage::{ImageReference, Reference};
use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

const SHA256_PREFIX: &str = "sha256:";

/// Key of a cache entry: a blob digest, or a manifest named by tag or digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Blob(String),
    Manifest(ImageReference),
}

/// Content-addressable blob and manifest storage
pub struct CacheStorage {
    base_dir: PathBuf,
    blobs_dir: PathBuf,
    manifests_dir: PathBuf,
    blob_fills: SingleFlight<BlobSource>,
    manifest_fills: SingleFlight<CachedManifest>,
    /// Blobs being written right now, keyed by digest
    writing: Arc<Mutex<HashMap<String, BlobFill>>>,
    temp_counter: AtomicU64,
}

impl CacheStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let blobs_dir = base_dir.join("blobs").join("sha256");
        let manifests_dir = base_dir.join("manifests");

        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| ProxyError::Cache(format!("Failed to create blobs dir: {}", e)))?;
        std::fs::create_dir_all(&manifests_dir)
            .map_err(|e| ProxyError::Cache(format!("Failed to create manifests dir: {}", e)))?;

        // Leftovers of fills interrupted by a restart
        if let Ok(entries) = std::fs::read_dir(&blobs_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        Ok(Self {
            base_dir,
            blobs_dir,
            manifests_dir,
            blob_fills: SingleFlight::new(),
            manifest_fills: SingleFlight::new(),
            writing: Arc::new(Mutex::new(HashMap::new())),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Blob fills being started, keyed by digest
    pub fn blob_fills(&self) -> &SingleFlight<BlobSource> {
        &self.blob_fills
    }

    /// In-flight manifest fills, keyed by canonical image reference
    pub fn manifest_fills(&self) -> &SingleFlight<CachedManifest> {
        &self.manifest_fills
    }

    // ---- generic contract ----

    pub async fn has(&self, key: &CacheKey) -> bool {
        match key {
            CacheKey::Blob(digest) => self.blob_size(digest).await.ok().flatten().is_some(),
            CacheKey::Manifest(image) => self.lookup_manifest(image).await.ok().flatten().is_some(),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        match key {
            CacheKey::Blob(digest) => self.read_blob(digest).await,
            CacheKey::Manifest(image) => {
                Ok(self.lookup_manifest(image).await?.map(|manifest| manifest.body))
            }
        }
    }

    /// Store `data` under `key`. Storing the same content twice is a no-op.
    pub async fn put(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        match key {
            CacheKey::Blob(digest) => self.write_blob(digest, &data).await,
            CacheKey::Manifest(image) => {
                let content_type = ManifestDocument::parse(&data)
                    .ok()
                    .and_then(|doc| doc.media_type)
                    .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string());
                self.write_manifest(image, &content_type, data).await?;
                Ok(())
            }
        }
    }

    /// Remove the entry for `key`. A tag key removes only the tag pointer.
    pub async fn evict(&self, key: &CacheKey) -> Result<bool> {
        match key {
            CacheKey::Blob(digest) => remove_if_exists(&self.blob_path(digest)?).await,
            CacheKey::Manifest(image) => match &image.reference {
                Reference::Tag(tag) => remove_if_exists(&self.tag_path(image, tag)).await,
                Reference::Digest(digest) => {
                    let _ = remove_if_exists(&self.manifest_meta_path(image, digest)?).await;
                    remove_if_exists(&self.manifest_path(image, digest)?).await
                }
            },
        }
    }

    // ---- blobs ----

    /// Get blob path for a digest
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir.join(digest_hex(digest)?))
    }

    /// Size of a cached blob. Empty files are treated as absent and removed.
    pub async fn blob_size(&self, digest: &str) -> Result<Option<u64>> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.len() > 0 => Ok(Some(metadata.len())),
            Ok(_) => {
                tracing::warn!(
                    digest = %digest,
                    cache_path = %path.display(),
                    "Cache file exists but is empty (size=0), removing"
                );
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to stat blob {}: {}",
                digest, e
            ))),
        }
    }

    /// Open a cached blob for streaming
    pub async fn open_blob(&self, digest: &str) -> Result<Option<(fs::File, u64)>> {
        let Some(size) = self.blob_size(digest).await? else {
            return Ok(None);
        };
        match fs::File::open(self.blob_path(digest)?).await {
            Ok(file) => Ok(Some((file, size))),
            // Evicted between the stat and the open
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to open blob {}: {}",
                digest, e
            ))),
        }
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>> {
        if self.blob_size(digest).await?.is_none() {
            return Ok(None);
        }
        match fs::read(self.blob_path(digest)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to read blob {}: {}",
                digest, e
            ))),
        }
    }

    /// Write blob content (atomic write), rejecting content that does not
    /// hash to `digest`
    pub async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest)?;
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(ProxyError::Registry(format!(
                "blob digest mismatch: expected {}, got {}",
                digest, actual
            )));
        }
        self.atomic_write(&path, data).await
    }

    /// Stream a blob body to disk while hashing it.
    ///
    /// The blob only becomes visible once the full body has been written and
    /// its sha256 matches `digest`, so a truncated or corrupted transfer is
    /// never served.
    pub async fn write_blob_stream<S, E>(&self, digest: &str, stream: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<ProxyError>,
    {
        let path = self.blob_path(digest)?;
        let temp_path = self.temp_path(&path);
        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create blob file: {}", e)))?;
        copy_verified(file, &temp_path, &path, digest, stream, None).await
    }

    /// The in-progress fill of `digest`, if one is being written
    pub fn blob_in_progress(&self, digest: &str) -> Option<BlobFill> {
        self.writing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(digest)
            .cloned()
    }

    /// Start writing `stream` as blob `digest` in the background.
    ///
    /// Readers can follow the returned fill while it is written. The fill
    /// keeps running when every reader has gone away; it is registered until
    /// the blob is either renamed into place or discarded.
    pub async fn start_blob_fill<S, E>(
        &self,
        digest: &str,
        content_length: Option<u64>,
        stream: S,
    ) -> Result<BlobFill>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: Into<ProxyError> + Send + 'static,
    {
        let path = self.blob_path(digest)?;
        let temp_path = self.temp_path(&path);
        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create blob file: {}", e)))?;

        let (progress, watcher) = watch::channel(FillProgress::Writing { written: 0 });
        let fill = BlobFill::new(digest, temp_path.clone(), content_length, watcher);
        self.writing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(digest.to_string(), fill.clone());

        let writing = self.writing.clone();
        let digest = digest.to_string();
        tokio::spawn(async move {
            let outcome = copy_verified(file, &temp_path, &path, &digest, stream, Some(&progress)).await;
            let last = match outcome {
                Ok(size) => FillProgress::Done { size },
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Blob fill failed");
                    FillProgress::Failed(Arc::new(e))
                }
            };
            // Published before unregistering: a newcomer either finds this
            // fill or the renamed blob
            progress.send_replace(last);
            writing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&digest);
        });

        Ok(fill)
    }

    // ---- manifests ----

    fn repository_dir(&self, image: &ImageReference) -> PathBuf {
        let mut dir = self.manifests_dir.join(&image.registry);
        for segment in image.repository.split('/') {
            dir.push(segment);
        }
        dir
    }

    /// Path: manifests/{registry}/{repository}/sha256/{hex}.json
    pub fn manifest_path(&self, image: &ImageReference, digest: &str) -> Result<PathBuf> {
        Ok(self
            .repository_dir(image)
            .join("sha256")
            .join(format!("{}.json", digest_hex(digest)?)))
    }

    /// Path: manifests/{registry}/{repository}/sha256/{hex}.meta.json
    pub fn manifest_meta_path(&self, image: &ImageReference, digest: &str) -> Result<PathBuf> {
        Ok(self
            .repository_dir(image)
            .join("sha256")
            .join(format!("{}.meta.json", digest_hex(digest)?)))
    }

    /// Path: manifests/{registry}/{repository}/tags/{tag}.digest
    pub fn tag_path(&self, image: &ImageReference, tag: &str) -> PathBuf {
        self.repository_dir(image)
            .join("tags")
            .join(format!("{}.digest", tag))
    }

    /// Digest a cached tag points to
    pub async fn resolve_tag(&self, image: &ImageReference, tag: &str) -> Result<Option<String>> {
        let path = self.tag_path(image, tag);
        match fs::read_to_string(&path).await {
            Ok(digest) => {
                let digest = digest.trim().to_string();
                if digest_hex(&digest).is_err() {
                    tracing::warn!(
                        image = %image,
                        path = %path.display(),
                        "Ignoring malformed tag-to-digest mapping"
                    );
                    return Ok(None);
                }
                Ok(Some(digest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to read tag mapping {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Read a manifest stored under `digest` in the repository of `image`
    pub async fn read_manifest(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<Option<CachedManifest>> {
        let path = self.manifest_path(image, digest)?;
        let body = match fs::read(&path).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::Cache(format!(
                    "Failed to read manifest {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let meta_path = self.manifest_meta_path(image, digest)?;
        let metadata = match fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice::<ManifestMetadata>(&raw).ok(),
            Err(_) => None,
        };
        let metadata = metadata.unwrap_or_else(|| {
            // Sidecar lost: fall back to what the document declares
            let content_type = ManifestDocument::parse(&body)
                .ok()
                .and_then(|doc| doc.media_type)
                .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string());
            ManifestMetadata {
                digest: digest.to_string(),
                content_type,
                size: body.len() as u64,
                cached_at: Utc::now(),
            }
        });

        Ok(Some(CachedManifest { body, metadata }))
    }

    /// Cached manifest for a tag or digest reference
    pub async fn lookup_manifest(&self, image: &ImageReference) -> Result<Option<CachedManifest>> {
        let digest = match &image.reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => match self.resolve_tag(image, tag).await? {
                Some(digest) => digest,
                None => return Ok(None),
            },
        };
        self.read_manifest(image, &digest).await
    }

    /// Store a manifest under its computed digest, then point the tag at it.
    ///
    /// A digest reference must match the content.
    pub async fn write_manifest(
        &self,
        image: &ImageReference,
        content_type: &str,
        body: Bytes,
    ) -> Result<CachedManifest> {
        let digest = sha256_digest(&body);
        if let Reference::Digest(expected) = &image.reference {
            if *expected != digest {
                return Err(ProxyError::Registry(format!(
                    "manifest digest mismatch for {}: got {}",
                    image, digest
                )));
            }
        }

        let metadata = ManifestMetadata {
            digest: digest.clone(),
            content_type: content_type.to_string(),
            size: body.len() as u64,
            cached_at: Utc::now(),
        };

        self.atomic_write(&self.manifest_path(image, &digest)?, &body)
            .await?;
        self.atomic_write(
            &self.manifest_meta_path(image, &digest)?,
            &serde_json::to_vec(&metadata)?,
        )
        .await?;

        if let Reference::Tag(tag) = &image.reference {
            self.atomic_write(&self.tag_path(image, tag), digest.as_bytes())
                .await?;
            tracing::debug!(
                registry = %image.registry,
                repository = %image.repository,
                tag = %tag,
                digest = %digest,
                "Tag-to-digest mapping written"
            );
        }

        Ok(CachedManifest { body, metadata })
    }

    // ---- helpers ----

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{}.tmp", std::process::id(), n));
        path.with_file_name(name)
    }

    /// Atomic write: write to a unique temp file, then rename over `path`
    async fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ProxyError::Cache(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let temp_path = self.temp_path(path);
        let written: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ProxyError::Cache(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            )));
        }

        fs::rename(&temp_path, path).await.map_err(|e| {
            ProxyError::Cache(format!("Failed to rename {}: {}", path.display(), e))
        })
    }
}

/// Copy `stream` into `file` (open on `temp_path`) while hashing, then rename
/// it to `path` if the content hashes to `digest`. Reports flushed bytes to
/// `progress` after every chunk. The temp file never outlives a failure.
async fn copy_verified<S, E>(
    mut file: fs::File,
    temp_path: &Path,
    path: &Path,
    digest: &str,
    stream: S,
    progress: Option<&watch::Sender<FillProgress>>,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<ProxyError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    let outcome: Result<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ProxyError::Cache(format!("Failed to write blob: {}", e)))?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                file.flush()
                    .await
                    .map_err(|e| ProxyError::Cache(format!("Failed to write blob: {}", e)))?;
                progress.send_replace(FillProgress::Writing { written });
            }
        }
        file.sync_all()
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to sync blob: {}", e)))?;
        Ok(())
    }
    .await;
    drop(file);

    if let Err(e) = outcome {
        let _ = fs::remove_file(temp_path).await;
        return Err(e);
    }

    let actual = format!("{}{:x}", SHA256_PREFIX, hasher.finalize());
    if actual != digest {
        let _ = fs::remove_file(temp_path).await;
        tracing::warn!(
            expected = %digest,
            actual = %actual,
            bytes = written,
            "Discarding blob with mismatched digest"
        );
        return Err(ProxyError::Registry(format!(
            "blob digest mismatch: expected {}, got {}",
            digest, actual
        )));
    }

    if let Err(e) = fs::rename(temp_path, path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(ProxyError::Cache(format!("Failed to rename blob: {}", e)));
    }

    tracing::debug!(digest = %digest, bytes = written, "Blob written to cache");
    Ok(written)
}

/// `sha256:<hex>` digest of `data`
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{:x}", SHA256_PREFIX, Sha256::digest(data))
}

/// Hex part of a sha256 digest, rejecting anything that is not one
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| ProxyError::InvalidReference(format!("unsupported digest {}", digest)))?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(ProxyError::InvalidReference(format!("malformed digest {}", digest)));
    }
    Ok(hex)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ProxyError::Cache(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_validation() {
        let digest = sha256_digest(b"hello");
        assert_eq!(digest_hex(&digest).unwrap().len(), 64);
        assert!(digest_hex("sha256:../../etc/passwd").is_err());
        assert!(digest_hex("md5:abcd").is_err());
        assert!(digest_hex(&digest.to_uppercase().replace("SHA256", "sha256")).is_err());
    }
}
