//! CachedImage lifecycle reconciler
//!
//! Each pass re-reads the record, recomputes its expiry from the owner set
//! and persists the result. Unowned records past their deadline are deleted
//! with a resourceVersion precondition, then their cached content is evicted
//! unless a surviving record still reaches it.
//!
//! [`LifecycleReconciler::reconcile_at`] takes the current time explicitly so
//! expiry can be driven by a fake clock.

use crate::config::LifecycleConfig;
use crate::error::{ControllerError, Result};
use cachedimage::{modify_status, CachedImage, Decision, ImageStore};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use proxy::{CacheStorage, EvictionReport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 300;

/// Consecutive failed passes after which the record shows `lastError`
pub const DEGRADED_AFTER_FAILURES: u32 = 5;

/// Result of one lifecycle pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record does not exist (anymore)
    Gone,
    /// The record stays; look at it again after `requeue_after`
    Kept { requeue_after: Duration },
    /// The record expired and was deleted
    Deleted { eviction: Option<EvictionReport> },
    /// The record changed between evaluation and deletion
    Contended,
}

pub struct LifecycleReconciler {
    store: Arc<dyn ImageStore>,
    cache: Option<Arc<CacheStorage>>,
    config: LifecycleConfig,
    failures: Mutex<HashMap<String, u32>>,
}

impl LifecycleReconciler {
    pub fn new(
        store: Arc<dyn ImageStore>,
        cache: Option<Arc<CacheStorage>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// One pass for record `name` under the configured deadline
    pub async fn reconcile(&self, name: &str) -> Result<Outcome> {
        tokio::time::timeout(self.config.reconcile_timeout(), self.reconcile_at(name, Utc::now()))
            .await
            .map_err(|_| ControllerError::Timeout {
                what: format!("lifecycle pass for {}", name),
                secs: self.config.reconcile_timeout_secs,
            })?
    }

    /// One pass for record `name` as of `now`
    pub async fn reconcile_at(&self, name: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let delay = self.config.expiry_delay();
        let mut decision = Decision::Keep {
            requeue_after: None,
        };

        let updated = modify_status(self.store.as_ref(), name, None, |status| {
            let before = status.clone();
            decision = status.evaluate(now, delay);
            *status != before
        })
        .await?;
        let Some(record) = updated else {
            return Ok(Outcome::Gone);
        };

        match decision {
            Decision::Keep { requeue_after } => {
                let max = self.config.max_requeue();
                let requeue_after = requeue_after
                    .and_then(|left| left.to_std().ok())
                    .map_or(max, |left| left.min(max));
                debug!(name = %name, requeue_after_secs = requeue_after.as_secs(), "CachedImage kept");
                Ok(Outcome::Kept { requeue_after })
            }
            Decision::Delete => self.delete_expired(&record).await,
        }
    }

    async fn delete_expired(&self, record: &CachedImage) -> Result<Outcome> {
        let name = record.name_any();
        match self
            .store
            .delete(&name, record.resource_version().as_deref())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(name = %name, "CachedImage changed before deletion, re-evaluating");
                return Ok(Outcome::Contended);
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            name = %name,
            image = %record.spec.source_image,
            "Deleted expired CachedImage"
        );
        self.forget(&name);

        let eviction = self.evict(record).await;
        Ok(Outcome::Deleted { eviction })
    }

    /// Best-effort removal of the deleted record's cache content
    async fn evict(&self, record: &CachedImage) -> Option<EvictionReport> {
        let cache = self.cache.as_ref()?;
        let Some(image) = record.source() else {
            warn!(image = %record.spec.source_image, "Unparseable source image, skipping eviction");
            return None;
        };

        let deleted = record.name_any();
        let survivors: Vec<_> = match self.store.list().await {
            Ok(records) => records
                .iter()
                .filter(|other| other.name_any() != deleted)
                .filter_map(|other| other.source())
                .collect(),
            Err(e) => {
                warn!(image = %image, error = %e, "Cannot list surviving records, skipping eviction");
                return None;
            }
        };

        match cache.evict_unreferenced(&image, &survivors).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(image = %image, error = %e, "Cache eviction failed");
                None
            }
        }
    }

    /// Count a failed pass for `name`; returns the failure streak and the backoff
    pub fn record_pass_failure(&self, name: &str) -> (u32, Duration) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let streak = failures.entry(name.to_string()).or_insert(0);
        *streak = streak.saturating_add(1);
        (*streak, failure_backoff(*streak))
    }

    pub fn record_pass_success(&self, name: &str) {
        self.forget(name);
    }

    fn forget(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }

    /// Surface a persistent failure on the record without touching its phase
    pub async fn mark_degraded(&self, name: &str, reason: &str) -> Result<()> {
        modify_status(self.store.as_ref(), name, None, |status| {
            if status.last_error.as_deref() == Some(reason) {
                return false;
            }
            status.last_error = Some(reason.to_string());
            true
        })
        .await?;
        Ok(())
    }

    /// Drive the reconciler from CachedImage watch events until `shutdown`
    pub async fn run(self: Arc<Self>, client: Client, shutdown: CancellationToken) {
        let api: Api<CachedImage> = Api::all(client);
        info!(
            expiry_delay_days = self.config.expiry_delay_days,
            "Starting CachedImage lifecycle controller"
        );

        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile_object, error_policy, self)
            .for_each(|result| async move {
                match result {
                    Ok((object, action)) => {
                        debug!(name = %object.name, action = ?action, "Lifecycle pass finished")
                    }
                    Err(e) => warn!(error = %e, "Lifecycle controller error"),
                }
            })
            .await;

        info!("CachedImage lifecycle controller stopped");
    }
}

/// Exponential backoff: 5 s, doubling, capped at 5 minutes
pub fn failure_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << exponent);
    Duration::from_secs(secs.min(BACKOFF_MAX_SECS))
}

async fn reconcile_object(
    object: Arc<CachedImage>,
    reconciler: Arc<LifecycleReconciler>,
) -> Result<Action> {
    let name = object.name_any();
    let outcome = reconciler.reconcile(&name).await?;
    reconciler.record_pass_success(&name);

    Ok(match outcome {
        Outcome::Gone | Outcome::Deleted { .. } => Action::await_change(),
        Outcome::Kept { requeue_after } => Action::requeue(requeue_after),
        Outcome::Contended => Action::requeue(Duration::from_secs(1)),
    })
}

fn error_policy(
    object: Arc<CachedImage>,
    error: &ControllerError,
    reconciler: Arc<LifecycleReconciler>,
) -> Action {
    let name = object.name_any();
    let (failures, backoff) = reconciler.record_pass_failure(&name);
    error!(
        name = %name,
        failures = failures,
        retry_in_secs = backoff.as_secs(),
        error = %error,
        "Lifecycle pass failed"
    );

    if failures >= DEGRADED_AFTER_FAILURES {
        let reason = error.to_string();
        tokio::spawn(async move {
            if let Err(e) = reconciler.mark_degraded(&name, &reason).await {
                warn!(name = %name, error = %e, "Cannot record degraded status");
            }
        });
    }
    Action::requeue(backoff)
}
