//! Client-side record of the remote dataset.

use super::artifacts::ArtifactCache;
use super::registry::ColumnRegistry;
use crate::backend::UploadPayload;
use crate::error::{CoordinatorError, ValidationError};
use crate::model::{OperationId, OperationKind, SessionState};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    /// Bumped on every successful (re)upload.
    epoch: u64,
    upload: Option<UploadPayload>,
    pub(crate) registry: ColumnRegistry,
    pub(crate) artifacts: ArtifactCache,
    in_flight: Option<(OperationId, OperationKind)>,
    last_committed: Option<OperationId>,
    last_failed: Option<OperationId>,
    pub(crate) model_trained: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Empty,
            epoch: 0,
            upload: None,
            registry: ColumnRegistry::default(),
            artifacts: ArtifactCache::default(),
            in_flight: None,
            last_committed: None,
            last_failed: None,
            model_trained: false,
        }
    }
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn upload_payload(&self) -> Option<&UploadPayload> {
        self.upload.as_ref()
    }

    pub fn last_committed(&self) -> Option<OperationId> {
        self.last_committed
    }

    pub fn last_failed(&self) -> Option<OperationId> {
        self.last_failed
    }

    /// Checks that need session state rather than form state.
    pub fn preflight(&self, kind: OperationKind) -> Result<(), CoordinatorError> {
        if kind.needs_dataset() && self.state == SessionState::Empty {
            return Err(CoordinatorError::NoDataset);
        }
        Ok(())
    }

    pub fn require_trained_model(&self, what: &'static str) -> Result<(), CoordinatorError> {
        if self.model_trained {
            Ok(())
        } else {
            Err(ValidationError::NoTrainedModel(what).into())
        }
    }

    pub fn begin_mutation(&mut self, id: OperationId, kind: OperationKind) {
        self.in_flight = Some((id, kind));
        self.state = if kind == OperationKind::Upload {
            SessionState::Uploading
        } else {
            SessionState::Mutating
        };
    }

    pub fn mark_lost(&mut self) {
        self.state = SessionState::Lost;
    }

    pub fn begin_upload(&mut self) {
        self.state = SessionState::Uploading;
    }

    /// A dataset is (again) present on the backend; everything derived from the
    /// previous one is discarded.
    pub fn restore(&mut self, payload: UploadPayload) {
        let forgotten = self.registry.derived_names().len();
        if forgotten > 0 {
            debug!(forgotten, "derived columns dropped with the previous dataset");
        }
        self.epoch += 1;
        self.upload = Some(payload);
        self.registry.reset();
        self.artifacts.clear();
        self.model_trained = false;
        self.state = match self.in_flight {
            Some((_, kind)) if kind != OperationKind::Upload => SessionState::Mutating,
            _ => SessionState::Ready,
        };
    }

    /// Called after any mutation commits.
    pub fn invalidate(&mut self) {
        self.registry.invalidate();
        let evicted = self.artifacts.evict_stale(self.registry.version());
        if evicted > 0 {
            debug!(evicted, version = self.registry.version(), "stale artifacts evicted");
        }
    }

    /// Record a terminal outcome.
    pub fn finish(&mut self, id: OperationId, ok: bool) {
        if self.in_flight.is_some_and(|(current, _)| current == id) {
            self.in_flight = None;
            self.state = match self.state {
                SessionState::Mutating => SessionState::Ready,
                SessionState::Uploading if self.upload.is_some() => SessionState::Ready,
                SessionState::Uploading => SessionState::Empty,
                other => other,
            };
        }
        if ok {
            self.last_committed = Some(id);
        } else {
            self.last_failed = Some(id);
        }
    }
}

/// Mutex around the session. Never held across an `.await`.
#[derive(Debug, Default)]
pub struct SessionCell(Mutex<Session>);

impl SessionCell {
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
