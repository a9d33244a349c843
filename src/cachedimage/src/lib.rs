//! CachedImage records
//!
//! This crate holds everything the proxy and the controllers share about the
//! `CachedImage` custom resource: the resource type itself, canonical image
//! references, the per-record lifecycle state machine, and the versioned
//! record store with its optimistic-concurrency update loop.

pub mod error;
pub mod kube_store;
pub mod lifecycle;
pub mod memory;
pub mod reference;
pub mod resource;
pub mod store;
pub mod tracker;

pub use error::{ReferenceError, StoreError};
pub use kube_store::KubeImageStore;
pub use lifecycle::Decision;
pub use memory::MemoryImageStore;
pub use reference::{ImageReference, Reference, DEFAULT_REGISTRY_NAME};
pub use resource::{CachedImage, CachedImageSpec, CachedImageStatus, ImagePhase, PodReference};
pub use store::{modify_status, ImageStore, MAX_CONFLICT_RETRIES};
pub use tracker::UsageTracker;
