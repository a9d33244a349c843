pub mod cache;
pub mod config;
pub mod error;
pub mod prepull;
pub mod registry;
pub mod server;
pub mod state;

pub use cache::{CacheKey, CacheStorage, EvictionReport};
pub use config::{ProxyConfig, RegistryConfig};
pub use error::{ProxyError, Result};
pub use server::{build_router, ProxyServer};
pub use state::AppState;
