//! Pod reconciler: keeps CachedImage owner sets in line with running pods.

use crate::config::PodsConfig;
use crate::error::{ControllerError, Result};
use cachedimage::{modify_status, CachedImage, ImageReference, ImageStore, PodReference};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owner changes made by one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PodPass {
    pub added: usize,
    pub released: usize,
}

pub fn pod_reference(pod: &Pod) -> Option<PodReference> {
    Some(PodReference::new(pod.namespace()?, pod.metadata.name.clone()?))
}

/// Deleted, or done running for good
pub fn is_finished(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Canonical images of every init, regular and ephemeral container of `pod`
pub fn pod_images(pod: &Pod, proxy_hosts: &[String]) -> BTreeSet<ImageReference> {
    let Some(spec) = pod.spec.as_ref() else {
        return BTreeSet::new();
    };

    let init = spec.init_containers.iter().flatten().map(|c| c.image.as_deref());
    let regular = spec.containers.iter().map(|c| c.image.as_deref());
    let ephemeral = spec
        .ephemeral_containers
        .iter()
        .flatten()
        .map(|c| c.image.as_deref());

    init.chain(regular)
        .chain(ephemeral)
        .flatten()
        .filter_map(|image| match ImageReference::parse_with_proxy_hosts(image, proxy_hosts) {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(
                    pod = %pod.name_any(),
                    image = %image,
                    error = %e,
                    "Skipping unparseable container image"
                );
                None
            }
        })
        .collect()
}

/// Names of the records each pod owns
type OwnerIndex = BTreeMap<PodReference, BTreeSet<String>>;

fn index_owners(records: &[CachedImage]) -> OwnerIndex {
    let mut index = OwnerIndex::new();
    for record in records {
        let name = record.name_any();
        for owner in record.status.iter().flat_map(|status| status.owners.iter()) {
            index.entry(owner.clone()).or_default().insert(name.clone());
        }
    }
    index
}

pub struct PodReconciler {
    store: Arc<dyn ImageStore>,
    config: PodsConfig,
    expiry_delay: chrono::Duration,
    proxy_hosts: Vec<String>,
    /// Loaded from the store on first use and rebuilt by every resync;
    /// pod events only touch the records whose owners change
    owners: Mutex<Option<OwnerIndex>>,
}

impl PodReconciler {
    pub fn new(
        store: Arc<dyn ImageStore>,
        config: PodsConfig,
        expiry_delay: chrono::Duration,
        proxy_hosts: Vec<String>,
    ) -> Self {
        Self {
            store,
            config,
            expiry_delay,
            proxy_hosts,
            owners: Mutex::new(None),
        }
    }

    pub fn is_ignored(&self, pod: &Pod) -> bool {
        pod.namespace().as_deref() == Some(self.config.ignore_namespace.as_str())
    }

    /// Make `pod` an owner of exactly the images its spec uses, or of none
    /// once it has finished
    pub async fn apply_at(&self, pod: &Pod, now: DateTime<Utc>) -> Result<PodPass> {
        if self.is_ignored(pod) {
            return Ok(PodPass::default());
        }
        let Some(owner) = pod_reference(pod) else {
            return Ok(PodPass::default());
        };
        if is_finished(pod) {
            let released = self.release_at(&owner, now).await?;
            return Ok(PodPass { added: 0, released });
        }

        let images = pod_images(pod, &self.proxy_hosts);
        let wanted: BTreeSet<String> = images.iter().map(ImageReference::resource_name).collect();
        let owned = self.owned_by(&owner).await?;

        let mut pass = PodPass::default();
        for image in &images {
            if self.add_owner(image, &owner, now).await? {
                pass.added += 1;
            }
        }

        // Images edited out of the pod spec
        for name in owned.difference(&wanted) {
            if self.remove_owner(name, &owner, now).await? {
                pass.released += 1;
            }
        }
        self.set_owned(&owner, wanted).await;

        if pass != PodPass::default() {
            info!(
                pod = %owner,
                added = pass.added,
                released = pass.released,
                "Updated image owners"
            );
        }
        Ok(pass)
    }

    /// Drop `pod` from every record it owns. Unknown pods are a no-op.
    pub async fn release_at(&self, pod: &PodReference, now: DateTime<Utc>) -> Result<usize> {
        let mut released = 0;
        for name in self.owned_by(pod).await? {
            if self.remove_owner(&name, pod, now).await? {
                released += 1;
            }
        }
        self.set_owned(pod, BTreeSet::new()).await;
        if released > 0 {
            info!(pod = %pod, released = released, "Released images of pod");
        }
        Ok(released)
    }

    /// Drop every owner that is not in `live` and rebuild the owner index.
    /// Returns the owners removed.
    pub async fn resync_at(&self, live: &BTreeSet<PodReference>, now: DateTime<Utc>) -> Result<usize> {
        let records = self.store.list().await?;
        let mut released = 0;
        for record in &records {
            let name = record.name_any();
            let stale: Vec<PodReference> = record
                .status
                .iter()
                .flat_map(|status| status.owners.iter())
                .filter(|owner| !live.contains(owner))
                .cloned()
                .collect();
            for owner in stale {
                if self.remove_owner(&name, &owner, now).await? {
                    debug!(name = %name, pod = %owner, "Released owner of vanished pod");
                    released += 1;
                }
            }
        }

        let mut index = index_owners(&records);
        index.retain(|owner, _| live.contains(owner));
        *self.owners.lock().await = Some(index);

        info!(live_pods = live.len(), released = released, "Pod resync finished");
        Ok(released)
    }

    async fn owned_by(&self, pod: &PodReference) -> Result<BTreeSet<String>> {
        let mut owners = self.owners.lock().await;
        if owners.is_none() {
            let index = index_owners(&self.store.list().await?);
            debug!(pods = index.len(), "Loaded image owner index");
            *owners = Some(index);
        }
        Ok(owners
            .as_ref()
            .and_then(|index| index.get(pod))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_owned(&self, pod: &PodReference, names: BTreeSet<String>) {
        if let Some(index) = self.owners.lock().await.as_mut() {
            if names.is_empty() {
                index.remove(pod);
            } else {
                index.insert(pod.clone(), names);
            }
        }
    }

    async fn add_owner(&self, image: &ImageReference, pod: &PodReference, now: DateTime<Utc>) -> Result<bool> {
        let mut changed = false;
        modify_status(self.store.as_ref(), &image.resource_name(), Some(image), |status| {
            changed = status.add_owner(pod.clone(), now);
            changed
        })
        .await?;
        Ok(changed)
    }

    async fn remove_owner(&self, name: &str, pod: &PodReference, now: DateTime<Utc>) -> Result<bool> {
        let delay = self.expiry_delay;
        let mut changed = false;
        modify_status(self.store.as_ref(), name, None, |status| {
            changed = status.remove_owner(pod, now, delay);
            changed
        })
        .await?;
        Ok(changed)
    }

    async fn timed<T, F>(&self, what: String, pass: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.reconcile_timeout(), pass)
            .await
            .map_err(|_| ControllerError::Timeout {
                what,
                secs: self.config.reconcile_timeout_secs,
            })?
    }

    async fn apply(&self, pod: &Pod) {
        let what = format!("pod pass for {}/{}", pod.namespace().unwrap_or_default(), pod.name_any());
        if let Err(e) = self.timed(what, self.apply_at(pod, Utc::now())).await {
            error!(pod = %pod.name_any(), error = %e, "Pod pass failed");
        }
    }

    async fn release(&self, pod: &Pod) {
        if self.is_ignored(pod) {
            return;
        }
        let Some(owner) = pod_reference(pod) else {
            return;
        };
        if let Err(e) = self
            .timed(format!("release of {}", owner), self.release_at(&owner, Utc::now()))
            .await
        {
            error!(pod = %owner, error = %e, "Releasing pod images failed");
        }
    }

    async fn resync(&self, live: &BTreeSet<PodReference>) {
        if let Err(e) = self.timed("pod resync".to_string(), self.resync_at(live, Utc::now())).await {
            error!(error = %e, "Pod resync failed");
        }
    }

    /// Re-apply every pod and release owners of pods that no longer run
    async fn full_resync(&self, api: &Api<Pod>) {
        let pods = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(error = %e, "Cannot list pods for resync");
                return;
            }
        };

        let mut live = BTreeSet::new();
        for pod in &pods {
            self.apply(pod).await;
            if !is_finished(pod) {
                live.extend(pod_reference(pod));
            }
        }
        self.resync(&live).await;
    }

    /// Follow pod events until `shutdown`, resyncing periodically
    pub async fn run(self: Arc<Self>, client: Client, shutdown: CancellationToken) {
        let api: Api<Pod> = Api::all(client);
        let mut events = watcher::watcher(api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();

        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the initial list covers startup
        resync.tick().await;

        info!(
            ignore_namespace = %self.config.ignore_namespace,
            resync_interval_secs = self.config.resync_interval_secs,
            "Starting pod reconciler"
        );

        // Pods seen during the current (re)list
        let mut listing: Option<BTreeSet<PodReference>> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => self.full_resync(&api).await,
                event = events.next() => match event {
                    Some(Ok(Event::Init)) => listing = Some(BTreeSet::new()),
                    Some(Ok(Event::InitApply(pod))) => {
                        if let Some(live) = listing.as_mut() {
                            if !is_finished(&pod) {
                                live.extend(pod_reference(&pod));
                            }
                        }
                        self.apply(&pod).await;
                    }
                    Some(Ok(Event::InitDone)) => {
                        if let Some(live) = listing.take() {
                            self.resync(&live).await;
                        }
                    }
                    Some(Ok(Event::Apply(pod))) => self.apply(&pod).await,
                    Some(Ok(Event::Delete(pod))) => self.release(&pod).await,
                    Some(Err(e)) => warn!(error = %e, "Pod watch error"),
                    None => {
                        warn!("Pod watch stream ended");
                        break;
                    }
                },
            }
        }

        info!("Pod reconciler stopped");
    }
}
