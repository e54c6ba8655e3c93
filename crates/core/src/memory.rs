//! In-memory `PodStore` and recording `EventSink` used by tests across the workspace.
//!
//! The store behaves like a tiny API server: every successful write bumps the
//! resourceVersion, merge patches honour a `metadata.resourceVersion` precondition,
//! removing a missing label is rejected, and a terminating pod disappears once its
//! last finalizer is gone.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio_util::sync::CancellationToken;

use crate::{cancellable, is_terminating, EventSink, JobEvent, MatchLabels, ObjectKey, OperationJob, PodPatch, PodStore, StoreError, StoreResult};

/// Scripted result for the next patch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Apply,
    Conflict,
    Fail(String),
}

#[derive(Default)]
struct State {
    pods: BTreeMap<ObjectKey, Pod>,
    next_rv: u64,
    next_uid: u64,
    patches: Vec<(ObjectKey, PodPatch)>,
    script: VecDeque<PatchOutcome>,
    live_gets: usize,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `pod`, filling in namespace, uid and a fresh resourceVersion.
    pub fn insert(&self, mut pod: Pod) -> Pod {
        let mut st = self.state();
        if pod.metadata.namespace.is_none() {
            pod.metadata.namespace = Some("default".to_string());
        }
        if pod.metadata.uid.is_none() {
            st.next_uid += 1;
            pod.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", st.next_uid));
        }
        pod.metadata.resource_version = Some(st.bump());
        if let Some(key) = ObjectKey::of(&pod) {
            st.pods.insert(key, pod.clone());
        }
        pod
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Pod> {
        self.state().pods.remove(key)
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.state().pods.get(key).cloned()
    }

    /// Request deletion. Pods without finalizers go away immediately.
    pub fn mark_deleting(&self, key: &ObjectKey) -> Option<Pod> {
        let mut st = self.state();
        let rv = st.bump();
        let pod = st.pods.get_mut(key)?;
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        pod.metadata.resource_version = Some(rv);
        let out = pod.clone();
        if out.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true) {
            st.pods.remove(key);
        }
        Some(out)
    }

    /// Queue outcomes consumed by the next patch calls, in order.
    pub fn script<I: IntoIterator<Item = PatchOutcome>>(&self, outcomes: I) {
        self.state().script.extend(outcomes);
    }

    /// Every patch attempt, including rejected ones.
    pub fn patches(&self) -> Vec<(ObjectKey, PodPatch)> {
        self.state().patches.clone()
    }

    pub fn patch_count(&self) -> usize {
        self.state().patches.len()
    }

    pub fn live_gets(&self) -> usize {
        self.state().live_gets
    }

    fn apply(&self, key: &ObjectKey, patch: &PodPatch) -> StoreResult<Pod> {
        let mut st = self.state();
        st.patches.push((key.clone(), patch.clone()));
        match st.script.pop_front() {
            Some(PatchOutcome::Conflict) => {
                return Err(StoreError::Conflict { key: key.clone(), message: "scripted conflict".into() })
            }
            Some(PatchOutcome::Fail(msg)) => return Err(StoreError::Api(msg)),
            Some(PatchOutcome::Apply) | None => {}
        }
        let current = st.pods.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut next = match patch {
            PodPatch::Merge(body) => {
                let expected = body.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str());
                if let Some(expected) = expected {
                    if current.metadata.resource_version.as_deref() != Some(expected) {
                        return Err(StoreError::Conflict {
                            key: key.clone(),
                            message: format!("resourceVersion {} is stale", expected),
                        });
                    }
                }
                let mut doc = serde_json::to_value(&current)?;
                json_patch::merge(&mut doc, body);
                serde_json::from_value::<Pod>(doc)?
            }
            PodPatch::RemoveLabel(label) => {
                let mut pod = current;
                let removed = pod.metadata.labels.as_mut().and_then(|l| l.remove(label));
                if removed.is_none() {
                    return Err(StoreError::Invalid {
                        key: key.clone(),
                        message: format!("unable to remove nonexistent label {}", label),
                    });
                }
                pod
            }
        };
        next.metadata.resource_version = Some(st.bump());
        let gone = is_terminating(&next) && next.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
        if gone {
            st.pods.remove(key);
        } else {
            st.pods.insert(key.clone(), next.clone());
        }
        Ok(next)
    }
}

#[async_trait::async_trait]
impl PodStore for MemoryStore {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        cancellable(ctx, async { Ok(self.pod(key)) }).await
    }

    async fn get_live(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        cancellable(ctx, async {
            let mut st = self.state();
            st.live_gets += 1;
            Ok(st.pods.get(key).cloned())
        })
        .await
    }

    async fn list(&self, ctx: &CancellationToken, namespace: &str, selector: &MatchLabels) -> StoreResult<Vec<Pod>> {
        cancellable(ctx, async {
            Ok(self
                .state()
                .pods
                .iter()
                .filter(|(k, p)| k.namespace == namespace && selector.matches(p))
                .map(|(_, p)| p.clone())
                .collect())
        })
        .await
    }

    async fn patch(&self, ctx: &CancellationToken, key: &ObjectKey, patch: &PodPatch) -> StoreResult<Pod> {
        cancellable(ctx, async { self.apply(key, patch) }).await
    }
}

/// Keeps every published event for assertions.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(ObjectKey, JobEvent)>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ObjectKey, JobEvent)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, e)| e.reason).collect()
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, job: &OperationJob, event: JobEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push((job.key(), event));
    }
}
