pub mod content;
pub mod filling;
pub mod metadata;
pub mod singleflight;
pub mod storage;

pub use content::{EvictionReport, ImageContent};
pub use filling::{BlobFill, BlobSource, FillProgress};
pub use metadata::{CachedManifest, ManifestDocument, ManifestMetadata};
pub use singleflight::SingleFlight;
pub use storage::{digest_hex, sha256_digest, CacheKey, CacheStorage};
