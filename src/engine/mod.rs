//! The session coordinator.
//!
//! Every panel goes through [`Coordinator::submit_as`]: the operation is admitted by the
//! [`RequestQueue`], executed against the backend (behind the recovery guard), and its
//! reply committed to the shared [`Session`] under a short synchronous lock.

mod artifacts;
pub mod exploration;
pub mod formula;
mod queue;
mod recovery;
mod registry;
mod session;
pub mod training;
pub mod treatment;

#[cfg(test)]
pub(crate) mod testing;

pub use queue::RequestQueue;
pub use session::Session;

use crate::backend::{
    Backend, CustomFeatureReply, ExplorationReply, InterpretabilityReply, TrainModelReply,
    UploadPayload,
};
use crate::error::{BackendError, CoordinatorError, ValidationError};
use crate::model::{
    AnalysisView, ColumnSet, ExplorationArtifact, ExplorationKind, FeatureOutcome, FollowUp,
    InterpretabilityArtifact, InterpretabilityKind, ModelArtifact, OperationId, OperationKind,
    SessionState, TreatmentOutcome,
};
use bytes::Bytes;
use exploration::ExplorationRequest;
use formula::FeatureFormula;
use recovery::SessionRecoveryGuard;
use serde::Serialize;
use session::SessionCell;
use std::sync::Arc;
use tracing::{debug, info, warn};
use training::ModelRun;
use treatment::TreatmentRequest;

/// A typed request against the session.
#[derive(Debug, Clone)]
pub enum Operation {
    Upload(UploadPayload),
    UploadContext(Vec<UploadPayload>),
    Discovery,
    Treatment(TreatmentRequest),
    FeatureGeneration(FeatureFormula),
    ModelTraining(ModelRun),
    Interpretability(InterpretabilityKind),
    Exploration(ExplorationRequest),
    Download,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Upload(_) => OperationKind::Upload,
            Operation::UploadContext(_) => OperationKind::ContextUpload,
            Operation::Discovery => OperationKind::Discovery,
            Operation::Treatment(_) => OperationKind::Treatment,
            Operation::FeatureGeneration(_) => OperationKind::FeatureGeneration,
            Operation::ModelTraining(_) => OperationKind::ModelTraining,
            Operation::Interpretability(_) => OperationKind::Interpretability,
            Operation::Exploration(_) => OperationKind::Exploration,
            Operation::Download => OperationKind::Download,
        }
    }

    /// Checks against the session, run once the operation is admitted.
    fn preflight(&self, session: &Session) -> Result<(), CoordinatorError> {
        session.preflight(self.kind())?;
        match self {
            Operation::UploadContext(files) if files.is_empty() => {
                Err(ValidationError::NoContextFiles.into())
            }
            Operation::Interpretability(kind) => session.require_trained_model(kind.label()),
            Operation::Exploration(req) => Ok(req.validate()?),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "output", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Uploaded { file_name: String },
    ContextUploaded { files: Vec<String> },
    Columns(ColumnSet),
    Treated(TreatmentOutcome),
    Feature(FeatureOutcome),
    Trained(Box<ModelArtifact>),
    Interpretation(InterpretabilityArtifact),
    Exploration(ExplorationArtifact),
    /// Serialised as the byte count.
    Downloaded(#[serde(serialize_with = "serialize_len")] Bytes),
}

fn serialize_len<S: serde::Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(bytes.len() as u64)
}

/// A committed operation and the registry version it left behind.
#[derive(Debug, Clone, Serialize)]
pub struct Committed {
    pub id: OperationId,
    pub kind: OperationKind,
    pub registry_version: u64,
    #[serde(flatten)]
    pub output: OperationOutput,
}

/// Raw backend result, turned into session state by [`commit`].
enum Reply {
    Uploaded(UploadPayload),
    ContextUploaded(Vec<String>),
    Columns {
        base: Vec<String>,
        augmented: Vec<String>,
    },
    Cached(ColumnSet),
    Treated(TreatmentOutcome),
    Feature(CustomFeatureReply),
    Trained(TrainModelReply),
    Interpretation(InterpretabilityKind, InterpretabilityReply),
    Exploration(ExplorationKind, ExplorationReply),
    Downloaded(Bytes),
}

struct Inner {
    backend: Arc<dyn Backend>,
    queue: RequestQueue,
    session: SessionCell,
    recovery: SessionRecoveryGuard,
}

/// Cloneable handle to the single shared session.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                queue: RequestQueue::new(),
                session: SessionCell::default(),
                recovery: SessionRecoveryGuard::default(),
            }),
        }
    }

    /// Reserve an id ahead of submission so a caller can track the request.
    pub fn reserve_id(&self) -> OperationId {
        self.inner.queue.reserve_id()
    }

    async fn submit_as(&self, id: OperationId, op: Operation) -> Result<Committed, CoordinatorError> {
        let inner = &*self.inner;
        let kind = op.kind();
        let admission = inner.queue.admit(kind).await;
        debug!(op_id = %id, %kind, exclusive = admission.is_exclusive(), "admitted");

        let admitted_at = {
            let mut s = inner.session.lock();
            if let Err(err) = op.preflight(&s) {
                s.finish(id, false);
                debug!(op_id = %id, %kind, error = %err, "rejected before dispatch");
                return Err(err);
            }
            if kind.mutates() {
                s.begin_mutation(id, kind);
            }
            s.registry.version()
        };

        let reply = dispatch(inner, id, &op, admitted_at).await;

        let mut s = inner.session.lock();
        let result = reply.and_then(|(reply, fetched_at)| commit(&mut s, kind, fetched_at, reply));
        s.finish(id, result.is_ok());
        let registry_version = s.registry.version();
        drop(s);
        drop(admission);

        match result {
            Ok(output) => {
                info!(op_id = %id, %kind, registry_version, "committed");
                Ok(Committed {
                    id,
                    kind,
                    registry_version,
                    output,
                })
            }
            Err(err) => {
                warn!(op_id = %id, %kind, class = err.class().as_str(), error = %err, "failed");
                Err(err)
            }
        }
    }

    /// Replace the session's dataset.
    pub async fn upload(&self, id: OperationId, payload: UploadPayload) -> Result<Committed, CoordinatorError> {
        self.submit_as(id, Operation::Upload(payload)).await
    }

    /// Send reference documents the backend cites in interpretability answers.
    pub async fn upload_context(
        &self,
        id: OperationId,
        files: Vec<UploadPayload>,
    ) -> Result<Committed, CoordinatorError> {
        self.submit_as(id, Operation::UploadContext(files)).await
    }

    /// Current columns; served from the registry unless a mutation invalidated it.
    pub async fn columns(&self, id: OperationId) -> Result<Committed, CoordinatorError> {
        self.submit_as(id, Operation::Discovery).await
    }

    pub async fn explore(&self, id: OperationId, req: ExplorationRequest) -> Result<Committed, CoordinatorError> {
        self.submit_as(id, Operation::Exploration(req)).await
    }

    pub async fn download(&self, id: OperationId) -> Result<Committed, CoordinatorError> {
        self.submit_as(id, Operation::Download).await
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state()
    }

    pub fn last_committed(&self) -> Option<OperationId> {
        self.inner.session.lock().last_committed()
    }

    pub fn last_failed(&self) -> Option<OperationId> {
        self.inner.session.lock().last_failed()
    }

    pub fn mutations_in_flight(&self) -> usize {
        self.inner.queue.mutations_in_flight()
    }

    /// The active model analysis, if it was computed against the current dataset.
    pub fn cached_analysis(&self) -> Option<AnalysisView> {
        let s = self.inner.session.lock();
        s.artifacts.analysis(s.registry.version()).cloned()
    }

    pub fn cached_exploration(&self, kind: ExplorationKind) -> Option<ExplorationArtifact> {
        let s = self.inner.session.lock();
        s.artifacts.exploration(kind, s.registry.version()).cloned()
    }
}

/// Run `op` against the backend. Returns the reply and the registry version it reflects.
async fn dispatch(
    inner: &Inner,
    id: OperationId,
    op: &Operation,
    admitted_at: u64,
) -> Result<(Reply, u64), CoordinatorError> {
    let backend = inner.backend.as_ref();
    let guard = &inner.recovery;
    let session = &inner.session;

    match op {
        // An explicit upload replaces the session; there is nothing to recover.
        Operation::Upload(payload) => {
            backend.upload(payload).await?;
            Ok((Reply::Uploaded(payload.clone()), admitted_at))
        }
        Operation::UploadContext(files) => {
            backend.upload_context(files).await?;
            let names = files.iter().map(|f| f.file_name.clone()).collect();
            Ok((Reply::ContextUploaded(names), admitted_at))
        }
        Operation::Discovery => {
            let cached = session.lock().registry.cached().cloned();
            if let Some(cached) = cached {
                debug!(op_id = %id, "columns served from registry");
                return Ok((Reply::Cached(cached), admitted_at));
            }
            let ((base, augmented), fetched_at) = guard
                .run(backend, session, id, || async move {
                    let base = backend.get_columns().await?;
                    let augmented = backend.get_augmented_columns().await?;
                    Ok::<_, BackendError>((base, augmented))
                })
                .await?;
            Ok((Reply::Columns { base, augmented }, fetched_at))
        }
        Operation::Treatment(req) => {
            let body = &req.body();
            let (message, fetched_at) = guard
                .run(backend, session, id, move || backend.apply_treatment(body))
                .await?;
            let outcome = TreatmentOutcome {
                message: if message.is_empty() {
                    "Treatment applied.".to_string()
                } else {
                    message
                },
                follow_up: FollowUp::ViewDistribution {
                    columns: req.columns.clone(),
                },
            };
            Ok((Reply::Treated(outcome), fetched_at))
        }
        Operation::FeatureGeneration(formula) => {
            let body = &formula.body();
            let (reply, fetched_at) = guard
                .run(backend, session, id, move || backend.custom_feature(body))
                .await?;
            Ok((Reply::Feature(reply), fetched_at))
        }
        Operation::ModelTraining(run) => {
            let body = &run.body();
            let (reply, fetched_at) = guard
                .run(backend, session, id, move || backend.train_model(body))
                .await?;
            Ok((Reply::Trained(reply), fetched_at))
        }
        Operation::Interpretability(kind) => {
            let kind = *kind;
            let (reply, fetched_at) = guard
                .run(backend, session, id, move || backend.interpretability(kind))
                .await?;
            Ok((Reply::Interpretation(kind, reply), fetched_at))
        }
        Operation::Exploration(req) => {
            let call = &req.call();
            let (reply, fetched_at) = guard
                .run(backend, session, id, move || backend.explore(call))
                .await?;
            Ok((Reply::Exploration(req.kind(), reply), fetched_at))
        }
        Operation::Download => {
            let (bytes, fetched_at) = guard.run(backend, session, id, move || backend.download()).await?;
            Ok((Reply::Downloaded(bytes), fetched_at))
        }
    }
}

/// Apply a reply to the session. Errors leave the session untouched.
///
/// Read results are cached only if the registry has not moved since `fetched_at`.
fn commit(
    s: &mut Session,
    kind: OperationKind,
    fetched_at: u64,
    reply: Reply,
) -> Result<OperationOutput, CoordinatorError> {
    let output = match reply {
        Reply::Uploaded(payload) => {
            let file_name = payload.file_name.clone();
            s.restore(payload);
            OperationOutput::Uploaded { file_name }
        }
        Reply::ContextUploaded(files) => OperationOutput::ContextUploaded { files },
        Reply::Cached(columns) => OperationOutput::Columns(columns),
        Reply::Columns { base, augmented } => {
            OperationOutput::Columns(s.registry.absorb(fetched_at, base, augmented))
        }
        Reply::Treated(outcome) => {
            s.invalidate();
            OperationOutput::Treated(outcome)
        }
        Reply::Feature(reply) => {
            let outcome = formula::outcome_from_reply(reply)?;
            if outcome.is_partial() {
                warn!(
                    column = %outcome.new_column,
                    failed_rows = outcome.failed_rows.len(),
                    "feature generated with failing rows"
                );
            }
            if !s.registry.register_derived(&outcome.new_column) {
                debug!(column = %outcome.new_column, "derived column already registered");
            }
            s.invalidate();
            OperationOutput::Feature(outcome)
        }
        Reply::Trained(reply) => {
            let artifact = training::artifact_from_reply(reply)?;
            s.invalidate();
            s.model_trained = true;
            let version = s.registry.version();
            s.artifacts
                .store_analysis(AnalysisView::Train(Box::new(artifact.clone())), version);
            OperationOutput::Trained(Box::new(artifact))
        }
        Reply::Interpretation(which, reply) => {
            let artifact = training::interpretability_from_reply(which, reply)?;
            if s.registry.version() == fetched_at {
                s.artifacts
                    .store_analysis(AnalysisView::from_interpretability(artifact.clone()), fetched_at);
            } else {
                debug!(%kind, fetched_at, current = s.registry.version(), "stale result not cached");
            }
            OperationOutput::Interpretation(artifact)
        }
        Reply::Exploration(which, reply) => {
            let artifact = exploration::artifact_from_reply(which, reply)?;
            if s.registry.version() == fetched_at {
                s.artifacts.store_exploration(artifact.clone(), fetched_at);
            } else {
                debug!(%kind, fetched_at, current = s.registry.version(), "stale result not cached");
            }
            OperationOutput::Exploration(artifact)
        }
        Reply::Downloaded(bytes) => OperationOutput::Downloaded(bytes),
    };
    debug_assert!(!kind.mutates() || s.registry.cached().is_none());
    Ok(output)
}
