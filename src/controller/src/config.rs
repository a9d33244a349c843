use crate::error::{ControllerError, Result};
use clap::Parser;
use proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Namespace the keeper itself runs in; its pods are never tracked
pub const DEFAULT_IGNORE_NAMESPACE: &str = "kuik-system";

#[derive(Parser, Debug, Default)]
#[command(
    name = "image-keeper",
    version,
    about = "Caches the container images a cluster runs and keeps them while they are in use"
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "IMAGE_KEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Days an unused image is kept before it is deleted
    #[arg(long = "expiry-delay", value_name = "DAYS")]
    pub expiry_delay: Option<u32>,

    #[arg(long = "proxy-port")]
    pub proxy_port: Option<u16>,

    /// Namespace whose pods are not tracked
    #[arg(long = "ignore-namespace")]
    pub ignore_namespace: Option<String>,

    #[arg(long = "cache-dir")]
    pub cache_dir: Option<String>,

    /// Print the CachedImage CustomResourceDefinition as YAML and exit
    #[arg(long = "print-crd")]
    pub print_crd: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub pods: PodsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_expiry_delay_days")]
    pub expiry_delay_days: u32,
    /// Consecutive upstream failures before a record turns `Error`
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,
    /// Longest wait before a record is looked at again
    #[serde(default = "default_max_requeue_secs")]
    pub max_requeue_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expiry_delay_days: default_expiry_delay_days(),
            error_threshold: default_error_threshold(),
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
            max_requeue_secs: default_max_requeue_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn expiry_delay(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.expiry_delay_days))
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn max_requeue(&self) -> Duration {
        Duration::from_secs(self.max_requeue_secs)
    }
}

fn default_expiry_delay_days() -> u32 {
    30
}

fn default_error_threshold() -> u32 {
    3
}

fn default_reconcile_timeout_secs() -> u64 {
    30
}

fn default_max_requeue_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodsConfig {
    #[serde(default = "default_ignore_namespace")]
    pub ignore_namespace: String,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,
}

impl Default for PodsConfig {
    fn default() -> Self {
        Self {
            ignore_namespace: default_ignore_namespace(),
            resync_interval_secs: default_resync_interval_secs(),
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
        }
    }
}

impl PodsConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}

fn default_ignore_namespace() -> String {
    DEFAULT_IGNORE_NAMESPACE.to_string()
}

fn default_resync_interval_secs() -> u64 {
    600
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            ControllerError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Configuration file (if any) with command-line overrides applied, validated
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(days) = cli.expiry_delay {
            self.lifecycle.expiry_delay_days = days;
        }
        if let Some(port) = cli.proxy_port {
            self.proxy.server.port = port;
        }
        if let Some(namespace) = &cli.ignore_namespace {
            self.pods.ignore_namespace = namespace.clone();
        }
        if let Some(dir) = &cli.cache_dir {
            self.proxy.cache.directory = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.expiry_delay_days == 0 {
            return Err(ControllerError::Config(
                "lifecycle.expiry_delay_days must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.error_threshold == 0 {
            return Err(ControllerError::Config(
                "lifecycle.error_threshold must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.reconcile_timeout_secs == 0
            || self.lifecycle.max_requeue_secs == 0
            || self.pods.reconcile_timeout_secs == 0
            || self.pods.resync_interval_secs == 0
        {
            return Err(ControllerError::Config(
                "timeouts and intervals must be greater than zero".to_string(),
            ));
        }
        self.proxy
            .validate()
            .map_err(|e| ControllerError::Config(e.to_string()))
    }
}
