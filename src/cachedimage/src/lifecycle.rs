//! CachedImage state machine
//!
//! Every transition is a method on [`CachedImageStatus`] that takes the current
//! time explicitly. The reconcile loops call these against a freshly read
//! record on every pass, so the same inputs always produce the same status.

use crate::resource::{CachedImageStatus, ImagePhase, PodReference};
use chrono::{DateTime, Duration, Utc};

/// Proxy pulls refresh `lastAccessedAt` at most this often
const ACCESS_REFRESH_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep the record; `requeue_after` is the time left before it expires
    Keep { requeue_after: Option<Duration> },
    /// Owner set is empty and the deadline has passed
    Delete,
}

impl CachedImageStatus {
    /// Add `pod` to the owner set. Cancels a pending expiry.
    ///
    /// Returns true if the status changed.
    pub fn add_owner(&mut self, pod: PodReference, now: DateTime<Utc>) -> bool {
        let inserted = self.owners.insert(pod);
        let was_expiring = self.expires_at.is_some() || self.phase == ImagePhase::Expired;
        if !inserted && !was_expiring {
            return false;
        }
        self.cancel_expiry();
        self.used_at = Some(now);
        true
    }

    /// Remove `pod` from the owner set, starting the expiry countdown when it
    /// was the last owner. Removing a pod that is not an owner is a no-op.
    pub fn remove_owner(
        &mut self,
        pod: &PodReference,
        now: DateTime<Utc>,
        expiry_delay: Duration,
    ) -> bool {
        if !self.owners.remove(pod) {
            return false;
        }
        self.used_at = Some(now);
        if self.owners.is_empty() {
            self.schedule_expiry(now, expiry_delay);
        }
        true
    }

    /// Record a successful resolution by the proxy.
    pub fn mark_cached(&mut self, digest: &str, now: DateTime<Utc>) -> bool {
        let access_is_fresh = self.last_accessed_at.is_some_and(|at| {
            now.signed_duration_since(at) < Duration::seconds(ACCESS_REFRESH_INTERVAL_SECS)
        });
        let unchanged = self.phase == ImagePhase::Cached
            && self.digest.as_deref() == Some(digest)
            && self.upstream_failures == 0
            && access_is_fresh;
        if unchanged {
            return false;
        }

        if self.phase != ImagePhase::Cached {
            tracing::debug!(from = %self.phase, digest = %digest, "Image transitioned to Cached");
        }
        self.phase = ImagePhase::Cached;
        self.cached_at.get_or_insert(now);
        self.digest = Some(digest.to_string());
        self.upstream_failures = 0;
        self.last_error = None;
        self.last_accessed_at = Some(now);
        true
    }

    /// Record an upstream failure that could not be served from the cache.
    pub fn record_failure(&mut self, reason: &str, threshold: u32) -> bool {
        self.upstream_failures = self.upstream_failures.saturating_add(1);
        self.last_error = Some(reason.to_string());
        if self.upstream_failures >= threshold && self.phase != ImagePhase::Expired {
            self.phase = ImagePhase::Error;
        }
        true
    }

    /// Recompute expiry from the owner set and timestamps.
    pub fn evaluate(&mut self, now: DateTime<Utc>, expiry_delay: Duration) -> Decision {
        if !self.owners.is_empty() {
            if self.expires_at.is_some() || self.phase == ImagePhase::Expired {
                self.cancel_expiry();
            }
            return Decision::Keep {
                requeue_after: None,
            };
        }

        let deadline = *self.expires_at.get_or_insert(now + expiry_delay);
        if now >= deadline {
            self.phase = ImagePhase::Expired;
            Decision::Delete
        } else {
            Decision::Keep {
                requeue_after: Some(deadline - now),
            }
        }
    }

    pub fn is_deletable(&self, now: DateTime<Utc>) -> bool {
        self.owners.is_empty() && self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn schedule_expiry(&mut self, now: DateTime<Utc>, expiry_delay: Duration) {
        if self.expires_at.is_none() {
            self.expires_at = Some(now + expiry_delay);
        }
    }

    fn cancel_expiry(&mut self) {
        self.expires_at = None;
        if self.phase == ImagePhase::Expired {
            self.phase = if self.cached_at.is_some() {
                ImagePhase::Cached
            } else {
                ImagePhase::Pending
            };
        }
    }
}
