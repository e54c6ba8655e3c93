//! opsjob ops: lifecycle actions driven per operation-job candidate.
//!
//! An action is a small state machine whose state lives entirely in labels and
//! finalizers on the target objects. The driver calls, per candidate and per
//! reconcile pass: `operate_target` (idempotent trigger), then `get_ops_progress`
//! (observation), and `release_target` when the job is torn down early.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use opsjob_core::{
    ActionProgress, EventSink, ObjectKey, OperationJob, OpsCandidate, PodStore, RegistrationError, StoreError,
    WatchRegistrar,
};
use tokio_util::sync::CancellationToken;

pub mod finalizer;
pub mod replace;

pub use finalizer::FinalizerCoordinator;
pub use replace::{ReplaceActionHandler, ACTION_REPLACE};

/// Infrastructure bound into every action at set-up.
#[derive(Clone)]
pub struct SharedContext {
    pub store: Arc<dyn PodStore>,
    pub events: Arc<dyn EventSink>,
}

impl SharedContext {
    pub fn new(store: Arc<dyn PodStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action {0} used before set_up")]
    NotSetUp(&'static str),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("fail to add {finalizer} finalizer to origin pod {key}: {source}")]
    AddFinalizer {
        key: ObjectKey,
        finalizer: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("fail to remove {finalizer} finalizer from origin pod {key}: {source}")]
    RemoveFinalizer {
        key: ObjectKey,
        finalizer: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("fail to label origin pod {key} with replace indication label: {source}")]
    LabelOrigin {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("fail to remove replace indication label from origin pod {key}: {source}")]
    UnlabelOrigin {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("fail to find replace new pod {key}: {source}")]
    ReplacementLookup {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("replace new pod {0} not found")]
    ReplacementNotFound(ObjectKey),
    #[error("unknown action {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    /// Cancellation of the caller's context, wherever it surfaced.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ActionError::Store(e)
            | ActionError::AddFinalizer { source: e, .. }
            | ActionError::RemoveFinalizer { source: e, .. }
            | ActionError::LabelOrigin { source: e, .. }
            | ActionError::UnlabelOrigin { source: e, .. }
            | ActionError::ReplacementLookup { source: e, .. } => matches!(e, StoreError::Cancelled),
            _ => false,
        }
    }
}

pub type ActionResult<T> = Result<T, ActionError>;

/// Contract every lifecycle action implements.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Bind shared infrastructure and register auxiliary watches. Safe to call again;
    /// watches are registered once.
    fn set_up(&mut self, registrar: &mut dyn WatchRegistrar, shared: &SharedContext) -> ActionResult<()>;

    /// The only mutating entry point. A no-op once the action is already triggered.
    /// Written objects are stored back into `candidate.pod`.
    async fn operate_target(&self, ctx: &CancellationToken, candidate: &mut OpsCandidate, job: &OperationJob) -> ActionResult<()>;

    /// Observe progress from the cached view. May record outcome fields on `candidate.status`.
    async fn get_ops_progress(
        &self,
        ctx: &CancellationToken,
        candidate: &mut OpsCandidate,
        job: &OperationJob,
    ) -> ActionResult<ActionProgress>;

    /// Undo the trigger when the job is torn down before a terminal state.
    async fn release_target(&self, ctx: &CancellationToken, candidate: &mut OpsCandidate, job: &OperationJob) -> ActionResult<()>;
}

/// Action kind -> handler, resolved once at startup.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in action.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register(ACTION_REPLACE, Box::new(ReplaceActionHandler::new()));
        reg
    }

    pub fn register(&mut self, kind: &str, handler: Box<dyn ActionHandler>) -> Option<Box<dyn ActionHandler>> {
        self.handlers.insert(kind.to_string(), handler)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn set_up_all(&mut self, registrar: &mut dyn WatchRegistrar, shared: &SharedContext) -> ActionResult<()> {
        for (kind, handler) in self.handlers.iter_mut() {
            handler.set_up(registrar, shared)?;
            tracing::debug!(action = %kind, "action set up");
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> ActionResult<&dyn ActionHandler> {
        self.handlers.get(kind).map(|h| h.as_ref()).ok_or_else(|| ActionError::UnknownAction(kind.to_string()))
    }
}

pub(crate) fn ensure_live(ctx: &CancellationToken) -> ActionResult<()> {
    if ctx.is_cancelled() {
        return Err(ActionError::Store(StoreError::Cancelled));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsjob_core::memory::{MemoryStore, RecordingEvents};
    use opsjob_core::PodMapper;

    #[derive(Default)]
    struct CountingRegistrar {
        names: Vec<String>,
    }

    impl WatchRegistrar for CountingRegistrar {
        fn watch_pods(&mut self, name: &str, _mapper: PodMapper) -> Result<(), RegistrationError> {
            self.names.push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn builtin_registry_resolves_replace() {
        let mut reg = ActionRegistry::with_builtin();
        assert_eq!(reg.kinds().collect::<Vec<_>>(), vec![ACTION_REPLACE]);
        let shared = SharedContext::new(Arc::new(MemoryStore::new()), Arc::new(RecordingEvents::new()));
        let mut registrar = CountingRegistrar::default();
        reg.set_up_all(&mut registrar, &shared).unwrap();
        reg.set_up_all(&mut registrar, &shared).unwrap();
        assert_eq!(registrar.names.len(), 1);
        assert!(reg.get(ACTION_REPLACE).is_ok());
        assert!(matches!(reg.get("Restart"), Err(ActionError::UnknownAction(_))));
    }

    #[test]
    fn cancellation_is_recognised_through_wrappers() {
        let key = ObjectKey::new("ns", "p");
        let e = ActionError::LabelOrigin { key: key.clone(), source: StoreError::Cancelled };
        assert!(e.is_cancelled());
        assert!(!ActionError::ReplacementNotFound(key).is_cancelled());
        let ctx = CancellationToken::new();
        assert!(ensure_live(&ctx).is_ok());
        ctx.cancel();
        assert!(ensure_live(&ctx).unwrap_err().is_cancelled());
    }
}
