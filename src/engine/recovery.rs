//! Transparent re-upload when the backend reports that its dataset is gone.

use super::session::SessionCell;
use crate::backend::Backend;
use crate::error::{BackendError, CoordinatorError};
use crate::model::OperationId;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SessionRecoveryGuard {
    /// Serialises re-uploads when several reads notice the loss at once.
    replay: Mutex<()>,
}

impl SessionRecoveryGuard {
    /// Run `call`; on a session-loss error, replay the last upload and run it once more.
    ///
    /// Returns the reply with the registry version read just before the attempt that
    /// produced it. A second failure of any kind, including another session loss, is
    /// returned as is.
    pub async fn run<T, F, Fut>(
        &self,
        backend: &dyn Backend,
        session: &SessionCell,
        id: OperationId,
        call: F,
    ) -> Result<(T, u64), CoordinatorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let (epoch, version) = {
            let s = session.lock();
            (s.epoch(), s.registry.version())
        };
        match call().await {
            Ok(value) => Ok((value, version)),
            Err(BackendError::NoActiveDataset { message }) => {
                warn!(op_id = %id, %message, "backend lost the dataset, replaying upload");
                self.recover(backend, session, epoch).await?;
                info!(op_id = %id, "retrying after recovery");
                let version = session.lock().registry.version();
                let value = call().await?;
                Ok((value, version))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn recover(
        &self,
        backend: &dyn Backend,
        session: &SessionCell,
        observed_epoch: u64,
    ) -> Result<(), CoordinatorError> {
        let _replay = self.replay.lock().await;

        let payload = {
            let mut s = session.lock();
            if s.epoch() != observed_epoch {
                debug!(epoch = s.epoch(), "dataset already re-uploaded");
                return Ok(());
            }
            s.mark_lost();
            let Some(payload) = s.upload_payload().cloned() else {
                return Err(CoordinatorError::NoDataset);
            };
            s.begin_upload();
            payload
        };

        match backend.upload(&payload).await {
            Ok(()) => {
                info!(file = %payload.file_name, "dataset re-uploaded");
                session.lock().restore(payload);
                Ok(())
            }
            Err(source) => {
                session.lock().mark_lost();
                Err(CoordinatorError::RecoveryFailed { source })
            }
        }
    }
}
