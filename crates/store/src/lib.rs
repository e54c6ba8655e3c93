//! opsjob store: watch-fed pod cache, cached `PodStore`, resourceVersion expectations

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, gauge};
use opsjob_core::{Delta, DeltaKind, MatchLabels, ObjectKey, PodPatch, PodStore, StoreResult, Uid, WatchUpdate};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod expectations;

pub use expectations::{ExpectationCache, ExpectationError, ResourceVersionExpectationItem};

/// Ingest channel / coalescer capacity.
pub fn queue_cap() -> usize {
    std::env::var("OPSJOB_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// Coalescing queue keyed by UID with FIFO order. Later deltas for the same UID replace
/// earlier ones; nothing is ever dropped, callers flush when `is_full`.
pub struct Coalescer {
    map: FxHashMap<Uid, Delta>,
    order: VecDeque<Uid>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.cap
    }

    pub fn push(&mut self, d: Delta) {
        let uid = d.uid;
        if !self.map.contains_key(&uid) {
            self.order.push_back(uid);
        }
        self.map.insert(uid, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&uid) {
                out.push(d);
            }
        }
        out
    }

    /// Throw away pending deltas; a relist supersedes them.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Immutable view of every pod observed so far.
#[derive(Debug, Clone, Default)]
pub struct PodSnapshot {
    pub epoch: u64,
    pods: FxHashMap<ObjectKey, Arc<Pod>>,
}

impl PodSnapshot {
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<Pod>> {
        self.pods.get(key)
    }

    /// Pods in `namespace` matching `selector`, ordered by name.
    pub fn list(&self, namespace: &str, selector: &MatchLabels) -> Vec<Arc<Pod>> {
        let mut hits: Vec<(&ObjectKey, &Arc<Pod>)> =
            self.pods.iter().filter(|(k, p)| k.namespace == namespace && selector.matches(p)).collect();
        hits.sort_by(|a, b| a.0.cmp(b.0));
        hits.into_iter().map(|(_, p)| Arc::clone(p)).collect()
    }

    pub fn resource_version(&self, key: &ObjectKey) -> Option<&str> {
        self.pods.get(key).and_then(|p| p.metadata.resource_version.as_deref())
    }
}

/// Builds `PodSnapshot`s from deltas.
pub struct PodWorld {
    epoch: u64,
    pods: FxHashMap<ObjectKey, (Uid, Arc<Pod>)>,
}

impl Default for PodWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PodWorld {
    pub fn new() -> Self {
        Self { epoch: 0, pods: FxHashMap::default() }
    }

    fn apply_one(&mut self, d: Delta) {
        let Some(key) = ObjectKey::of(&d.object) else {
            debug!("delta without name ignored");
            return;
        };
        match d.kind {
            DeltaKind::Applied => {
                self.pods.insert(key, (d.uid, d.object));
            }
            DeltaKind::Deleted => {
                // A same-named successor may already be in place.
                if self.pods.get(&key).map(|(uid, _)| *uid == d.uid).unwrap_or(false) {
                    self.pods.remove(&key);
                }
            }
        }
    }

    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            self.apply_one(d);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Replace the whole world with a fresh list.
    pub fn relist(&mut self, items: Vec<Delta>) {
        self.pods.clear();
        for d in items {
            self.apply_one(d);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<PodSnapshot> {
        let pods = self.pods.iter().map(|(k, (_, p))| (k.clone(), Arc::clone(p))).collect();
        Arc::new(PodSnapshot { epoch: self.epoch, pods })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct BackendHandle {
    snap: Arc<ArcSwap<PodSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl BackendHandle {
    pub fn current(&self) -> Arc<PodSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

fn publish(world: &PodWorld, snap: &ArcSwap<PodSnapshot>, epoch_tx: &watch::Sender<u64>) {
    let next = world.freeze();
    let epoch = next.epoch;
    gauge!("pod_cache_objects", next.len() as f64);
    snap.store(next);
    let _ = epoch_tx.send(epoch);
}

/// Spawn an ingest loop consuming watch updates and swapping snapshots.
/// Returns a sender for updates and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<WatchUpdate>, BackendHandle) {
    let (tx, mut rx) = mpsc::channel::<WatchUpdate>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(PodSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut world = PodWorld::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(WatchUpdate::Delta(d)) => {
                            if coalescer.is_full() {
                                world.apply(coalescer.drain_ready());
                                publish(&world, &snap_clone, &epoch_tx);
                            }
                            coalescer.push(d);
                        }
                        Some(WatchUpdate::Relisted(items)) => {
                            counter!("pod_cache_relists_total", 1u64);
                            coalescer.clear();
                            world.relist(items);
                            publish(&world, &snap_clone, &epoch_tx);
                        }
                        None => {
                            debug!("watch channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                world.apply(batch);
                                publish(&world, &snap_clone, &epoch_tx);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        world.apply(batch);
                        publish(&world, &snap_clone, &epoch_tx);
                    }
                }
            }
        }
        info!("ingest loop stopped");
    });

    (tx, BackendHandle { snap, epoch_rx })
}

/// `PodStore` that reads from the watch-fed snapshot and writes through `live`.
pub struct CachedStore<S> {
    backend: BackendHandle,
    live: Arc<S>,
}

impl<S: PodStore> CachedStore<S> {
    pub fn new(backend: BackendHandle, live: Arc<S>) -> Self {
        Self { backend, live }
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Whether the cached copy of `key` has caught up with the last recorded write.
    /// An absent object only counts as synced when nothing is expected for it.
    pub fn is_synced(&self, key: &ObjectKey, expectations: &ExpectationCache) -> bool {
        let id = key.to_string();
        match self.backend.current().resource_version(key) {
            Some(rv) => expectations.satisfied_expectations(&id, rv),
            None => matches!(expectations.get_expectations(&id), Ok(None)),
        }
    }
}

#[async_trait::async_trait]
impl<S: PodStore> PodStore for CachedStore<S> {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        opsjob_core::cancellable(ctx, async { Ok(self.backend.current().get(key).map(|p| (**p).clone())) }).await
    }

    async fn get_live(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        self.live.get_live(ctx, key).await
    }

    async fn list(&self, ctx: &CancellationToken, namespace: &str, selector: &MatchLabels) -> StoreResult<Vec<Pod>> {
        opsjob_core::cancellable(ctx, async {
            Ok(self.backend.current().list(namespace, selector).into_iter().map(|p| (*p).clone()).collect())
        })
        .await
    }

    async fn patch(&self, ctx: &CancellationToken, key: &ObjectKey, patch: &PodPatch) -> StoreResult<Pod> {
        self.live.patch(ctx, key, patch).await
    }
}
