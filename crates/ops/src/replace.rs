//! Replace action: swap an origin pod for a freshly created replacement.
//!
//! All state is carried by markers on the pods themselves:
//! - untriggered: the origin has none of the trigger labels
//! - triggered: the origin has the replace indication (ours) or an external trigger label,
//!   plus the protection finalizer
//! - paired: the origin names the instance id of its replacement
//! - observed: a replacement pod with that exact instance id exists
//! - succeeded / failed: the origin is gone, with or without a recorded replacement

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use opsjob_core::{
    has_label, is_terminating, labels, pod_label, ActionProgress, EventSink, JobEvent, MatchLabels, ObjectKey,
    OperationJob, OpsCandidate, OpsReason, PodMapper, PodPatch, PodStore, WatchRegistrar,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::finalizer::FinalizerCoordinator;
use crate::{ensure_live, ActionError, ActionHandler, ActionResult, SharedContext};

pub const ACTION_REPLACE: &str = "Replace";

/// Name of the auxiliary watch that wakes origins when their replacement changes.
pub const REPLACE_WATCH: &str = "replace-new-pods";

const EVENT_REPLACE_ORIGIN: &str = "ReplaceOriginPod";
const EVENT_REPLACE_NEW: &str = "ReplaceNewPod";

/// Any of the three markers means a replace is already under way for this origin.
pub fn replace_triggered(pod: &Pod) -> bool {
    has_label(pod, labels::REPLACE_INDICATION)
        || has_label(pod, labels::REPLACE_BY_UPDATE)
        || has_label(pod, labels::REPLACE_PAIR_NEW_ID)
}

/// Maps a replacement pod to the origin it takes over from.
pub fn origin_of_replacement(pod: &Pod) -> Vec<ObjectKey> {
    match (ObjectKey::of(pod), pod_label(pod, labels::REPLACE_PAIR_ORIGIN_NAME)) {
        (Some(key), Some(origin)) if !origin.is_empty() => vec![ObjectKey::new(key.namespace, origin)],
        _ => Vec::new(),
    }
}

struct Bound {
    store: Arc<dyn PodStore>,
    events: Arc<dyn EventSink>,
    finalizers: FinalizerCoordinator,
}

#[derive(Default)]
pub struct ReplaceActionHandler {
    bound: Option<Bound>,
    registered: bool,
}

impl ReplaceActionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn bound(&self) -> ActionResult<&Bound> {
        self.bound.as_ref().ok_or(ActionError::NotSetUp(ACTION_REPLACE))
    }

    /// The replacement of `origin` whose instance id equals `pair_id`, ignoring list order.
    async fn paired_replacement(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
        origin: &str,
        pair_id: &str,
    ) -> ActionResult<Option<Pod>> {
        let b = self.bound()?;
        let selector = MatchLabels::new().with(labels::REPLACE_PAIR_ORIGIN_NAME, origin);
        let candidates = b.store.list(ctx, namespace, &selector).await?;
        let total = candidates.len();
        let found = candidates.into_iter().find(|p| pod_label(p, labels::INSTANCE_ID) == Some(pair_id));
        if found.is_none() && total > 0 {
            debug!(origin = %origin, pair_id, total, "no replacement with matching instance id");
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl ActionHandler for ReplaceActionHandler {
    fn set_up(&mut self, registrar: &mut dyn WatchRegistrar, shared: &SharedContext) -> ActionResult<()> {
        if !self.registered {
            let mapper: PodMapper = Arc::new(origin_of_replacement);
            registrar.watch_pods(REPLACE_WATCH, mapper)?;
            self.registered = true;
        }
        self.bound = Some(Bound {
            store: Arc::clone(&shared.store),
            events: Arc::clone(&shared.events),
            finalizers: FinalizerCoordinator::new(Arc::clone(&shared.store)),
        });
        Ok(())
    }

    async fn operate_target(&self, ctx: &CancellationToken, candidate: &mut OpsCandidate, job: &OperationJob) -> ActionResult<()> {
        ensure_live(ctx)?;
        let b = self.bound()?;
        let Some(origin) = candidate.pod.as_ref() else {
            return Ok(());
        };
        if replace_triggered(origin) {
            return Ok(());
        }
        let key = candidate.key.clone();

        let guarded = b.finalizers.add(ctx, origin, labels::REPLACE_PROTECTION_FINALIZER).await.map_err(|source| {
            ActionError::AddFinalizer { key: key.clone(), finalizer: labels::REPLACE_PROTECTION_FINALIZER, source }
        })?;
        // Gone, or triggered by someone else since our read.
        if guarded.as_ref().map_or(true, replace_triggered) {
            debug!(origin = %key, "origin changed under trigger; nothing to label");
            candidate.pod = guarded;
            return Ok(());
        }
        candidate.pod = guarded;
        let labelled = b
            .store
            .patch(ctx, &key, &PodPatch::set_label(labels::REPLACE_INDICATION, "true"))
            .await
            .map_err(|source| ActionError::LabelOrigin { key: key.clone(), source })?;
        candidate.pod = Some(labelled);

        counter!("replace_triggered_total", 1u64);
        info!(job = %job.key(), origin = %key, "replace triggered");
        b.events
            .publish(job, JobEvent::normal(EVENT_REPLACE_ORIGIN, format!("triggered replace of origin pod {}", key)))
            .await;
        Ok(())
    }

    async fn get_ops_progress(
        &self,
        ctx: &CancellationToken,
        candidate: &mut OpsCandidate,
        job: &OperationJob,
    ) -> ActionResult<ActionProgress> {
        ensure_live(ctx)?;
        let b = self.bound()?;

        let Some(origin) = candidate.pod.as_ref() else {
            if candidate.status.reason == Some(OpsReason::ReplacedByNewObject) {
                let name = candidate.status.message.clone().unwrap_or_default();
                let new_key = job.target_key(&name);
                return match b.store.get_live(ctx, &new_key).await {
                    Ok(Some(_)) => Ok(ActionProgress::Succeeded),
                    Ok(None) => Err(ActionError::ReplacementNotFound(new_key)),
                    Err(source) => Err(ActionError::ReplacementLookup { key: new_key, source }),
                };
            }
            counter!("replace_origin_missing_total", 1u64);
            warn!(job = %job.key(), origin = %candidate.key, "origin pod vanished without a recorded replacement");
            candidate.status.reason = Some(OpsReason::OriginNotFound);
            b.events
                .publish(
                    job,
                    JobEvent::warning(
                        EVENT_REPLACE_ORIGIN,
                        format!("origin pod {} disappeared without a replacement", candidate.key),
                    ),
                )
                .await;
            return Ok(ActionProgress::Failed);
        };

        let Some(pair_id) = pod_label(origin, labels::REPLACE_PAIR_NEW_ID) else {
            return Ok(ActionProgress::Processing);
        };
        let origin_name = candidate.key.name.clone();
        let Some(replacement) = self.paired_replacement(ctx, &job.namespace, &origin_name, pair_id).await? else {
            return Ok(ActionProgress::Processing);
        };

        let new_name = replacement.metadata.name.clone().unwrap_or_default();
        let new_key = job.target_key(&new_name);
        if candidate.status.reason != Some(OpsReason::ReplacedByNewObject) {
            counter!("replace_paired_total", 1u64);
            info!(job = %job.key(), origin = %candidate.key, replacement = %new_key, "replacement observed");
        }
        candidate.status.reason = Some(OpsReason::ReplacedByNewObject);
        candidate.status.message = Some(new_name);
        b.events
            .publish(
                job,
                JobEvent::normal(EVENT_REPLACE_NEW, format!("replacement pod {} created for origin pod {}", new_key, candidate.key)),
            )
            .await;
        if has_label(&replacement, labels::SERVICE_AVAILABLE) {
            b.events
                .publish(
                    job,
                    JobEvent::normal(
                        EVENT_REPLACE_NEW,
                        format!("replacement pod {} is service available, origin pod {} can be deleted", new_key, origin_name),
                    ),
                )
                .await;
        }

        if is_terminating(origin) {
            let key = candidate.key.clone();
            let released = b.finalizers.remove(ctx, origin, labels::REPLACE_PROTECTION_FINALIZER).await.map_err(|source| {
                ActionError::RemoveFinalizer { key, finalizer: labels::REPLACE_PROTECTION_FINALIZER, source }
            })?;
            candidate.pod = released;
        }
        Ok(ActionProgress::Processing)
    }

    async fn release_target(&self, ctx: &CancellationToken, candidate: &mut OpsCandidate, job: &OperationJob) -> ActionResult<()> {
        ensure_live(ctx)?;
        let b = self.bound()?;
        let Some(origin) = candidate.pod.as_ref() else {
            return Ok(());
        };
        if is_terminating(origin) || !has_label(origin, labels::REPLACE_INDICATION) {
            return Ok(());
        }
        let key = candidate.key.clone();

        let released = b.finalizers.remove(ctx, origin, labels::REPLACE_PROTECTION_FINALIZER).await.map_err(|source| {
            ActionError::RemoveFinalizer { key: key.clone(), finalizer: labels::REPLACE_PROTECTION_FINALIZER, source }
        })?;
        let unlabel = released.as_ref().is_some_and(|p| has_label(p, labels::REPLACE_INDICATION));
        candidate.pod = released;
        if !unlabel {
            return Ok(());
        }
        let unlabelled = b
            .store
            .patch(ctx, &key, &PodPatch::RemoveLabel(labels::REPLACE_INDICATION.to_string()))
            .await
            .map_err(|source| ActionError::UnlabelOrigin { key: key.clone(), source })?;
        candidate.pod = Some(unlabelled);
        info!(job = %job.key(), origin = %key, "replace released");
        Ok(())
    }
}
