//! Idempotent add/remove of a finalizer on a pod.
//!
//! Writes replace the whole finalizer list and carry the resourceVersion the list was
//! read at, so a concurrent writer turns into a conflict instead of a lost update.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use opsjob_core::{ObjectKey, PodPatch, PodStore, StoreError, StoreResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Add,
    Remove,
}

/// New finalizer list, or `None` when `pod` already is in the wanted state.
fn edited(pod: &Pod, finalizer: &str, edit: Edit) -> Option<Vec<String>> {
    let current = pod.metadata.finalizers.clone().unwrap_or_default();
    let present = current.iter().any(|f| f == finalizer);
    match (edit, present) {
        (Edit::Add, true) | (Edit::Remove, false) => None,
        (Edit::Add, false) => {
            let mut next = current;
            next.push(finalizer.to_string());
            Some(next)
        }
        (Edit::Remove, true) => Some(current.into_iter().filter(|f| f != finalizer).collect()),
    }
}

#[derive(Clone)]
pub struct FinalizerCoordinator {
    store: Arc<dyn PodStore>,
}

impl FinalizerCoordinator {
    pub fn new(store: Arc<dyn PodStore>) -> Self {
        Self { store }
    }

    /// Ensure `finalizer` is on the pod. Returns the pod as last seen, `None` once it is gone.
    pub async fn add(&self, ctx: &CancellationToken, pod: &Pod, finalizer: &str) -> StoreResult<Option<Pod>> {
        self.update(ctx, pod, finalizer, Edit::Add).await
    }

    /// Ensure `finalizer` is gone from the pod. A vanished pod counts as released.
    pub async fn remove(&self, ctx: &CancellationToken, pod: &Pod, finalizer: &str) -> StoreResult<Option<Pod>> {
        self.update(ctx, pod, finalizer, Edit::Remove).await
    }

    async fn update(&self, ctx: &CancellationToken, pod: &Pod, finalizer: &str, edit: Edit) -> StoreResult<Option<Pod>> {
        let key = ObjectKey::of(pod).ok_or(StoreError::MissingMetadata("name"))?;
        let mut current = pod.clone();
        let mut retried = false;
        loop {
            let Some(next) = edited(&current, finalizer, edit) else {
                return Ok(Some(current));
            };
            let patch = PodPatch::finalizers(&next, current.metadata.resource_version.as_deref());
            match self.store.patch(ctx, &key, &patch).await {
                Ok(written) => {
                    debug!(pod = %key, finalizer, ?edit, "finalizer updated");
                    return Ok(Some(written));
                }
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) if e.is_conflict() && !retried => {
                    retried = true;
                    counter!("finalizer_conflict_retries_total", 1u64);
                    debug!(pod = %key, finalizer, error = %e, "finalizer conflict; retrying on fresh read");
                    match self.store.get_live(ctx, &key).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
