//! opsjob core types: operation candidates, replace markers and the object store seams.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "testing")]
pub mod memory;

pub type Uid = [u8; 16];

/// Label and finalizer keys shared with the rest of the replace machinery.
/// The strings are an interoperability surface: other controllers set and read them.
pub mod labels {
    /// Origin requests replace.
    pub const REPLACE_INDICATION: &str = "kusionstack.io/to-replace";
    /// Replace triggered by a replace-update rollout.
    pub const REPLACE_BY_UPDATE: &str = "kusionstack.io/replace-by-update";
    /// On the origin: instance id of the replacement it is paired with.
    pub const REPLACE_PAIR_NEW_ID: &str = "kusionstack.io/replace-pair-new-id";
    /// On the replacement: name of the origin it takes over from.
    pub const REPLACE_PAIR_ORIGIN_NAME: &str = "kusionstack.io/replace-pair-origin-name";
    pub const INSTANCE_ID: &str = "collaset.kusionstack.io/instance-id";
    pub const SERVICE_AVAILABLE: &str = "kusionstack.io/service-available";
    /// Blocks deletion of the origin until the replace settles.
    pub const REPLACE_PROTECTION_FINALIZER: &str = "finalizer.operationjob.kusionstack.io/replace-protected";
}

/// Namespace-qualified object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a pod, `None` when the pod has no name. Missing namespace maps to "default".
    pub fn of(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub const OPERATION_JOB_API_VERSION: &str = "apps.kusionstack.io/v1alpha1";
pub const OPERATION_JOB_KIND: &str = "OperationJob";

/// The batch operation a set of candidates belongs to. Only its identity is used here,
/// to attribute events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationJob {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    /// Names of target pods, all in the job's namespace.
    pub targets: Vec<String>,
}

impl OperationJob {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn target_key(&self, target: &str) -> ObjectKey {
        ObjectKey::new(&self.namespace, target)
    }

    /// Reference used as the involved object of recorded events.
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(OPERATION_JOB_API_VERSION.to_string()),
            kind: Some(OPERATION_JOB_KIND.to_string()),
            namespace: Some(self.namespace.clone()),
            name: Some(self.name.clone()),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

/// Symbolic outcome code carried in a candidate's operation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OpsReason {
    /// The origin has a confirmed replacement; `OpsStatus::message` names it.
    ReplacedByNewObject,
    /// The origin vanished without a recorded replacement.
    OriginNotFound,
    /// Any reason written by another action or driver.
    Other(String),
}

impl OpsReason {
    pub fn as_str(&self) -> &str {
        match self {
            OpsReason::ReplacedByNewObject => "ReplacedByNewPod",
            OpsReason::OriginNotFound => "PodNotFound",
            OpsReason::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for OpsReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ReplacedByNewPod" => OpsReason::ReplacedByNewObject,
            "PodNotFound" => OpsReason::OriginNotFound,
            _ => OpsReason::Other(s),
        }
    }
}

impl From<OpsReason> for String {
    fn from(r: OpsReason) -> Self {
        match r {
            OpsReason::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for OpsReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-candidate operation status. Persisting it is the driver's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsStatus {
    pub reason: Option<OpsReason>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionProgress {
    Processing,
    Succeeded,
    Failed,
}

impl ActionProgress {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionProgress::Processing)
    }
}

impl fmt::Display for ActionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionProgress::Processing => "Processing",
            ActionProgress::Succeeded => "Succeeded",
            ActionProgress::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One target of an operation job for a single reconcile pass.
#[derive(Debug, Clone)]
pub struct OpsCandidate {
    pub key: ObjectKey,
    /// Cached view of the target; `None` when it no longer exists.
    pub pod: Option<Pod>,
    pub status: OpsStatus,
}

impl OpsCandidate {
    pub fn new(key: ObjectKey, pod: Option<Pod>, status: OpsStatus) -> Self {
        Self { key, pod, status }
    }
}

pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

pub fn has_label(pod: &Pod, key: &str) -> bool {
    pod_label(pod, key).is_some()
}

pub fn has_finalizer(pod: &Pod, finalizer: &str) -> bool {
    pod.metadata.finalizers.as_ref().map(|f| f.iter().any(|s| s == finalizer)).unwrap_or(false)
}

/// Deletion was requested; the object lingers only while finalizers remain.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Equality label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchLabels(BTreeMap<String, String>);

impl MatchLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, pod: &Pod) -> bool {
        self.0.iter().all(|(k, v)| pod_label(pod, k) == Some(v.as_str()))
    }

    /// Selector string in the form the API server accepts.
    pub fn to_query(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// Escape a single JSON pointer reference token (RFC 6901).
pub fn escape_json_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Mutation issued against a pod.
#[derive(Debug, Clone, PartialEq)]
pub enum PodPatch {
    /// JSON merge patch (RFC 7386).
    Merge(serde_json::Value),
    /// JSON patch (RFC 6902) removing exactly one label key.
    RemoveLabel(String),
}

impl PodPatch {
    pub fn set_label(key: &str, value: &str) -> Self {
        PodPatch::Merge(serde_json::json!({ "metadata": { "labels": { key: value } } }))
    }

    /// Replace the whole finalizer list. With `resource_version` set the write is
    /// conditional and fails with a conflict if the object moved on.
    pub fn finalizers(finalizers: &[String], resource_version: Option<&str>) -> Self {
        let mut meta = serde_json::json!({ "finalizers": finalizers });
        if let Some(rv) = resource_version {
            meta["resourceVersion"] = serde_json::Value::String(rv.to_string());
        }
        PodPatch::Merge(serde_json::json!({ "metadata": meta }))
    }

    /// RFC 6902 operations for path based patches; `None` for merge patches.
    pub fn json_patch_ops(&self) -> Option<serde_json::Value> {
        match self {
            PodPatch::Merge(_) => None,
            PodPatch::RemoveLabel(key) => Some(serde_json::json!([
                { "op": "remove", "path": format!("/metadata/labels/{}", escape_json_pointer(key)) }
            ])),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error("invalid request for {key}: {message}")]
    Invalid { key: ObjectKey, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("object missing metadata.{0}")]
    MissingMetadata(&'static str),
    #[error("api: {0}")]
    Api(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Object store client for pods.
///
/// `get` and `list` may be served from a watch-fed cache and can lag behind writes;
/// `get_live` always asks the API server.
#[async_trait::async_trait]
pub trait PodStore: Send + Sync {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>>;

    async fn get_live(&self, ctx: &CancellationToken, key: &ObjectKey) -> StoreResult<Option<Pod>>;

    async fn list(&self, ctx: &CancellationToken, namespace: &str, selector: &MatchLabels) -> StoreResult<Vec<Pod>>;

    /// Apply `patch` and return the object as written.
    async fn patch(&self, ctx: &CancellationToken, key: &ObjectKey, patch: &PodPatch) -> StoreResult<Pod>;
}

/// Run `fut` unless `ctx` is cancelled first.
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Human readable event recorded against an operation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

impl JobEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: EventKind::Normal, reason: reason.into(), message: message.into() }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: EventKind::Warning, reason: reason.into(), message: message.into() }
    }
}

/// Event recorder. Publishing is best effort: sinks log their own failures.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, job: &OperationJob, event: JobEvent);
}

/// Maps a changed pod to the keys whose owners should be reconciled.
pub type PodMapper = Arc<dyn Fn(&Pod) -> Vec<ObjectKey> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("watch registration {name}: {message}")]
pub struct RegistrationError {
    pub name: String,
    pub message: String,
}

/// Registers auxiliary watches during action set-up.
pub trait WatchRegistrar: Send {
    /// Watch pods; registering the same `name` twice replaces the mapper.
    fn watch_pods(&mut self, name: &str, mapper: PodMapper) -> Result<(), RegistrationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A single observed change of one pod.
#[derive(Debug, Clone)]
pub struct Delta {
    pub uid: Uid,
    pub kind: DeltaKind,
    pub object: Arc<Pod>,
}

/// What the pod watcher feeds into the local cache.
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    Delta(Delta),
    /// Full relist; replaces everything previously observed.
    Relisted(Vec<Delta>),
}
