//! Reconcile loops that keep CachedImage records in line with the cluster
//!
//! - [`pods`]: owner sets follow the pods that use each image
//! - [`lifecycle`]: unowned records expire, are deleted and their cache
//!   content evicted

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pods;

pub use config::{Cli, Config, LifecycleConfig, PodsConfig};
pub use error::{ControllerError, Result};
pub use lifecycle::{LifecycleReconciler, Outcome};
pub use pods::{PodPass, PodReconciler};
