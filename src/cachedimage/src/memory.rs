//! In-process [`ImageStore`] with the same versioning rules as the API server.
//!
//! Backs the unit and integration tests of every crate.

use crate::error::StoreError;
use crate::resource::CachedImage;
use crate::store::ImageStore;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryImageStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, CachedImage>,
    version: u64,
    /// Number of upcoming `replace_status` calls to fail with a conflict
    injected_conflicts: u32,
    list_calls: usize,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` status writes fail as if another writer won the race.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().injected_conflicts = count;
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `list` has been called
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn snapshot(&self) -> Vec<CachedImage> {
        self.lock().objects.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-update; the map is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError> {
        Ok(self.lock().objects.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<CachedImage>, StoreError> {
        let mut state = self.lock();
        state.list_calls += 1;
        Ok(state.objects.values().cloned().collect())
    }

    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        let name = image.name_any();
        let mut state = self.lock();
        if state.objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut created = image.clone();
        created.status = None;
        created.metadata.resource_version = Some(state.next_version());
        created.metadata.creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        state.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_status(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        let name = image.name_any();
        let mut state = self.lock();
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(StoreError::Conflict(name));
        }

        let stored_version = match state.objects.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(StoreError::NotFound(name)),
        };
        if image.metadata.resource_version != stored_version {
            return Err(StoreError::Conflict(name));
        }

        let version = state.next_version();
        let stored = state
            .objects
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        stored.status = image.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn delete(
        &self,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.objects.get(name) else {
            return Ok(());
        };
        if let Some(expected) = resource_version {
            if stored.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(name.to_string()));
            }
        }
        state.objects.remove(name);
        Ok(())
    }
}
