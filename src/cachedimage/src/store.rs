use crate::error::StoreError;
use crate::reference::ImageReference;
use crate::resource::{CachedImage, CachedImageStatus};
use async_trait::async_trait;

/// Attempts made by [`modify_status`] before giving up on a contended record
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Versioned CachedImage storage.
///
/// Implementations must reject `replace_status` and `delete` calls whose
/// `resourceVersion` no longer matches the stored record with
/// [`StoreError::Conflict`]. `create` only persists metadata and spec; status is
/// written separately, like a status subresource.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError>;

    async fn list(&self) -> Result<Vec<CachedImage>, StoreError>;

    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError>;

    async fn replace_status(&self, image: &CachedImage) -> Result<CachedImage, StoreError>;

    /// Delete `name`, only if it still has `resource_version` when one is given.
    /// Deleting a record that does not exist succeeds.
    async fn delete(&self, name: &str, resource_version: Option<&str>)
        -> Result<(), StoreError>;
}

/// Read-modify-write the status of record `name`, retrying on conflict.
///
/// `mutate` is applied to a freshly read status on every attempt and returns
/// whether it changed anything; unchanged records are not written. When the
/// record does not exist it is created from `create_from`, or `Ok(None)` is
/// returned if no source is given.
pub async fn modify_status<S, F>(
    store: &S,
    name: &str,
    create_from: Option<&ImageReference>,
    mut mutate: F,
) -> Result<Option<CachedImage>, StoreError>
where
    S: ImageStore + ?Sized,
    F: FnMut(&mut CachedImageStatus) -> bool + Send,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let current = match store.get(name).await? {
            Some(current) => current,
            None => match create_from {
                None => return Ok(None),
                Some(image) => match store.create(&CachedImage::for_reference(image)).await {
                    Ok(created) => {
                        tracing::info!(name = %name, image = %image, "Created CachedImage");
                        created
                    }
                    Err(StoreError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(e),
                },
            },
        };

        let mut updated = current.clone();
        let status = updated.status.get_or_insert_with(CachedImageStatus::default);
        let changed = mutate(status);
        if !changed && current.status.is_some() {
            return Ok(Some(current));
        }

        match store.replace_status(&updated).await {
            Ok(saved) => return Ok(Some(saved)),
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(name = %name, attempt = attempt, "Conflict updating CachedImage status, retrying");
            }
            Err(StoreError::NotFound(_)) if create_from.is_none() => return Ok(None),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::ConflictRetry {
        name: name.to_string(),
        attempts: MAX_CONFLICT_RETRIES,
    })
}
