use crate::error::StoreError;
use crate::resource::CachedImage;
use crate::store::ImageStore;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};

/// CachedImage records stored as cluster-scoped custom resources
#[derive(Clone)]
pub struct KubeImageStore {
    api: Api<CachedImage>,
}

impl KubeImageStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    pub fn api(&self) -> &Api<CachedImage> {
        &self.api
    }
}

#[async_trait]
impl ImageStore for KubeImageStore {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<CachedImage>, StoreError> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        Ok(self.api.create(&PostParams::default(), image).await?)
    }

    async fn replace_status(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        // The full object is sent so the API server checks metadata.resourceVersion
        let data = serde_json::to_vec(image)?;
        Ok(self
            .api
            .replace_status(&image.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn delete(
        &self,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        match self.api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
