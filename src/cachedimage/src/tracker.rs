use crate::error::StoreError;
use crate::reference::ImageReference;
use crate::store::{modify_status, ImageStore};
use chrono::Utc;
use std::sync::Arc;

/// Records proxy activity on CachedImage records.
///
/// This is the proxy's side of the lifecycle: it never touches owners or
/// expiry, only the cached/error bookkeeping and the last access time.
pub struct UsageTracker {
    store: Arc<dyn ImageStore>,
    error_threshold: u32,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn ImageStore>, error_threshold: u32) -> Self {
        Self {
            store,
            error_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// Records are created for tag references only. Digest requests are
    /// mostly index children fetched by the runtime; pinned digests get their
    /// record from the pod reconciler.
    fn create_from(image: &ImageReference) -> Option<&ImageReference> {
        (!image.is_digest()).then_some(image)
    }

    /// The proxy resolved `image` to `digest` (from cache or upstream)
    pub async fn mark_cached(&self, image: &ImageReference, digest: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        modify_status(
            self.store.as_ref(),
            &image.resource_name(),
            Self::create_from(image),
            |status| status.mark_cached(digest, now),
        )
        .await?;
        Ok(())
    }

    /// The proxy failed to resolve `image` and had nothing cached to serve
    pub async fn record_failure(&self, image: &ImageReference, reason: &str) -> Result<(), StoreError> {
        let threshold = self.error_threshold;
        let updated = modify_status(
            self.store.as_ref(),
            &image.resource_name(),
            Self::create_from(image),
            |status| status.record_failure(reason, threshold),
        )
        .await?;

        if let Some(status) = updated.and_then(|ci| ci.status) {
            tracing::debug!(
                image = %image,
                failures = status.upstream_failures,
                phase = %status.phase,
                "Recorded upstream failure"
            );
        }
        Ok(())
    }
}
