//! opsjob kubehub – kube client, live pod store, events recorder and pod watch wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{
        events::{Event as KubeEvent, EventType, Recorder, Reporter},
        watcher::{self, Event},
    },
    Client,
};
use metrics::counter;
use opsjob_core::{
    cancellable, Delta, DeltaKind, EventKind, EventSink, JobEvent, MatchLabels, ObjectKey, OperationJob, PodMapper,
    PodPatch, PodStore, RegistrationError, StoreError, StoreResult, WatchRegistrar, WatchUpdate,
};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared client built from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await })
        .await
        .context("building kube client from default config")?;
    Ok(client.clone())
}

/// Field manager recorded on every patch.
pub fn field_manager() -> String {
    std::env::var("OPSJOB_FIELD_MANAGER").unwrap_or_else(|_| "opsjob-controller".to_string())
}

/// Translate a kube error for `key` into the store taxonomy.
pub fn map_kube_error(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { key: key.clone(), message: ae.message },
        kube::Error::Api(ae) if ae.code == 422 => StoreError::Invalid { key: key.clone(), message: ae.message },
        other => StoreError::Api(other.to_string()),
    }
}

/// `PodStore` talking straight to the API server. Every read is live.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: field_manager() }
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PodStore for KubeStore {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        self.get_live(ctx, key).await
    }

    async fn get_live(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>> {
        let api = self.api(&key.namespace);
        cancellable(ctx, async { api.get_opt(&key.name).await.map_err(|e| map_kube_error(key, e)) }).await
    }

    async fn list(&self, ctx: &CancellationToken, namespace: &str, selector: &MatchLabels) -> StoreResult<Vec<Pod>> {
        let api = self.api(namespace);
        let query = selector.to_query();
        let lp = if query.is_empty() { ListParams::default() } else { ListParams::default().labels(&query) };
        let scope = ObjectKey::new(namespace, "");
        cancellable(ctx, async { api.list(&lp).await.map(|l| l.items).map_err(|e| map_kube_error(&scope, e)) }).await
    }

    async fn patch(&self, ctx: &CancellationToken, key: &ObjectKey, patch: &PodPatch) -> StoreResult<Pod> {
        let api = self.api(&key.namespace);
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let json_ops: Option<json_patch::Patch> = match patch.json_patch_ops() {
            Some(ops) => Some(serde_json::from_value(ops)?),
            None => None,
        };
        cancellable(ctx, async {
            let res = match (patch, json_ops) {
                (PodPatch::Merge(body), _) => api.patch(&key.name, &pp, &Patch::Merge(body)).await,
                (PodPatch::RemoveLabel(_), Some(ops)) => api.patch(&key.name, &pp, &Patch::<()>::Json(ops)).await,
                (PodPatch::RemoveLabel(label), None) => {
                    return Err(StoreError::Invalid { key: key.clone(), message: format!("no json patch for label {}", label) })
                }
            };
            debug!(pod = %key, ok = res.is_ok(), "patch issued");
            res.map_err(|e| map_kube_error(key, e))
        })
        .await
    }
}

/// Records Kubernetes Events against the operation job.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, job: &OperationJob, event: JobEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), job.object_ref());
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let ev = KubeEvent {
            type_,
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            counter!("job_events_failed_total", 1u64);
            warn!(job = %job.key(), reason = %event.reason, error = %e, "failed to publish job event");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<opsjob_core::Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

pub fn delta_from(pod: Pod, kind: DeltaKind) -> Result<Delta> {
    let uid_str = pod.metadata.uid.as_deref().ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    Ok(Delta { uid, kind, object: Arc::new(pod) })
}

fn deltas_from(pods: Vec<Pod>, kind: DeltaKind) -> Vec<Delta> {
    pods.into_iter()
        .filter_map(|p| match delta_from(p, kind) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(error = %e, "skipping pod without usable uid");
                None
            }
        })
        .collect()
}

/// Pod watches registered by actions. Each mapper turns a changed pod into the keys
/// whose owners need another reconcile.
#[derive(Default)]
pub struct KubeWatchRegistrar {
    mappers: Vec<(String, PodMapper)>,
    trigger_tx: Option<mpsc::Sender<ObjectKey>>,
}

impl KubeWatchRegistrar {
    pub fn new(trigger_tx: mpsc::Sender<ObjectKey>) -> Self {
        Self { mappers: Vec::new(), trigger_tx: Some(trigger_tx) }
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Keys produced by all mappers for `pod`, deduplicated.
    pub fn triggers_for(&self, pod: &Pod) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.mappers.iter().flat_map(|(_, m)| m(pod)).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    async fn fire(&self, pod: &Pod) {
        let Some(tx) = &self.trigger_tx else { return };
        for key in self.triggers_for(pod) {
            if tx.send(key.clone()).await.is_err() {
                debug!(key = %key, "trigger channel closed");
                return;
            }
        }
    }
}

impl WatchRegistrar for KubeWatchRegistrar {
    fn watch_pods(&mut self, name: &str, mapper: PodMapper) -> Result<(), RegistrationError> {
        if name.is_empty() {
            return Err(RegistrationError { name: name.to_string(), message: "watch name must not be empty".into() });
        }
        match self.mappers.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = mapper,
            None => self.mappers.push((name.to_string(), mapper)),
        }
        info!(watch = %name, "pod watch registered");
        Ok(())
    }
}

/// One-shot list sent to the cache as a relist so the first snapshot is complete.
pub async fn prime_list(client: Client, namespace: Option<&str>, tx: &mpsc::Sender<WatchUpdate>) -> Result<usize> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let list = api.list(&ListParams::default()).await?;
    let deltas = deltas_from(list.items, DeltaKind::Applied);
    let n = deltas.len();
    tx.send(WatchUpdate::Relisted(deltas)).await.map_err(|_| anyhow!("cache ingest closed"))?;
    Ok(n)
}

/// Start list+watch for pods, feeding the cache and firing registered triggers.
pub async fn start_pod_watcher(
    client: Client,
    namespace: Option<&str>,
    cache_tx: mpsc::Sender<WatchUpdate>,
    registrar: KubeWatchRegistrar,
) -> Result<()> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, watches = registrar.len(), "pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        let update = match ev {
            Event::Applied(p) => {
                registrar.fire(&p).await;
                match delta_from(p, DeltaKind::Applied) {
                    Ok(d) => WatchUpdate::Delta(d),
                    Err(e) => {
                        warn!(error = %e, "skipping applied pod");
                        continue;
                    }
                }
            }
            Event::Deleted(p) => {
                registrar.fire(&p).await;
                match delta_from(p, DeltaKind::Deleted) {
                    Ok(d) => WatchUpdate::Delta(d),
                    Err(e) => {
                        warn!(error = %e, "skipping deleted pod");
                        continue;
                    }
                }
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for p in list.iter() {
                    registrar.fire(p).await;
                }
                WatchUpdate::Relisted(deltas_from(list, DeltaKind::Applied))
            }
        };
        if cache_tx.send(update).await.is_err() {
            debug!("cache ingest closed; stopping pod watcher");
            return Ok(());
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::error::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {}", code), reason: "r".into(), code })
    }

    fn pod(name: &str, uid: Option<&str>, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                uid: uid.map(String::from),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn kube_errors_map_onto_store_taxonomy() {
        let key = ObjectKey::new("ns", "p");
        assert!(map_kube_error(&key, api_err(404)).is_not_found());
        assert!(map_kube_error(&key, api_err(409)).is_conflict());
        assert!(matches!(map_kube_error(&key, api_err(422)), StoreError::Invalid { .. }));
        assert!(matches!(map_kube_error(&key, api_err(500)), StoreError::Api(_)));
    }

    #[test]
    fn delta_requires_uuid() {
        let ok = delta_from(pod("a", Some("00000000-0000-0000-0000-000000000007"), &[]), DeltaKind::Applied).unwrap();
        assert_eq!(ok.uid[15], 7);
        assert!(delta_from(pod("a", None, &[]), DeltaKind::Applied).is_err());
        assert!(delta_from(pod("a", Some("not-a-uuid"), &[]), DeltaKind::Applied).is_err());
    }

    #[test]
    fn registrar_replaces_by_name_and_dedups_triggers() {
        let (tx, _rx) = mpsc::channel(4);
        let mut reg = KubeWatchRegistrar::new(tx);
        let origin: PodMapper = Arc::new(|p: &Pod| {
            opsjob_core::pod_label(p, "origin").map(|o| vec![ObjectKey::new("ns", o)]).unwrap_or_default()
        });
        reg.watch_pods("replace", origin.clone()).unwrap();
        reg.watch_pods("replace", origin.clone()).unwrap();
        assert_eq!(reg.len(), 1);
        reg.watch_pods("again", origin).unwrap();
        let keys = reg.triggers_for(&pod("new", None, &[("origin", "old")]));
        assert_eq!(keys, vec![ObjectKey::new("ns", "old")]);
        assert!(reg.triggers_for(&pod("other", None, &[])).is_empty());
        assert!(reg.watch_pods("", Arc::new(|_: &Pod| Vec::new())).is_err());
    }

    #[tokio::test]
    async fn fire_sends_mapped_keys() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reg = KubeWatchRegistrar::new(tx);
        reg.watch_pods("replace", Arc::new(|p: &Pod| {
            opsjob_core::pod_label(p, "origin").map(|o| vec![ObjectKey::new("ns", o)]).unwrap_or_default()
        }))
        .unwrap();
        reg.fire(&pod("new", None, &[("origin", "old")])).await;
        assert_eq!(rx.recv().await, Some(ObjectKey::new("ns", "old")));
    }
}
