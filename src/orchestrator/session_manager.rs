//! Worker-side session lifecycle: register, heartbeat, update, shut down.
//!
//! A [`WorkerSession`] owns the current process's session record. While it
//! lives, a background task keeps the record's heartbeat fresh; a clean
//! [`WorkerSession::shutdown`] stops the task and deletes the record so the
//! reaper never has to.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::{current_worker_id, Payload, SessionRecord, SessionStatus};
use crate::persistence::session_repo::CreateOutcome;
use crate::supervisor::Supervisor;
use crate::Result;

use super::heartbeat::spawn_heartbeat_task;

/// Handle to the current worker's registered session.
///
/// Dropping the handle stops the heartbeat task but leaves the record in
/// place, as a crash would; the reaper reclaims it after the process exits
/// and the heartbeat goes stale.
pub struct WorkerSession {
    supervisor: Supervisor,
    worker_id: String,
    heartbeat_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl WorkerSession {
    /// Register the current process and start heartbeating.
    ///
    /// When `reaper.sweep_on_register` is set, one sweep runs first so
    /// records left by crashed predecessors are reclaimed at startup. A
    /// leftover record under this pid belongs to a dead process that had
    /// the same pid, and is replaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the record cannot be written.
    pub async fn register(supervisor: &Supervisor, payload: Payload) -> Result<Self> {
        let worker_id = current_worker_id();
        let span = info_span!("worker_register", worker_id = %worker_id);

        async move {
            if supervisor.config().reaper.sweep_on_register {
                if let Err(err) = supervisor.reaper().sweep().await {
                    warn!(%err, "startup sweep failed");
                }
            }

            let sessions = supervisor.sessions();
            let outcome = sessions.create(&worker_id, payload.clone())?;
            if let CreateOutcome::AlreadyExists(previous) = outcome {
                warn!(
                    created_at = %previous.created_at,
                    "replacing session record left by an earlier process with this pid"
                );
                let record =
                    SessionRecord::new(worker_id.clone(), payload, sessions.heartbeat_interval());
                sessions.put(&record)?;
            }

            let cancel = CancellationToken::new();
            let heartbeat_handle = spawn_heartbeat_task(
                supervisor.heartbeat().clone(),
                worker_id.clone(),
                supervisor.config().heartbeat.interval(),
                cancel.clone(),
            );

            info!("worker session registered");
            Ok(Self {
                supervisor: supervisor.clone(),
                worker_id,
                heartbeat_handle: Some(heartbeat_handle),
                cancel,
            })
        }
        .instrument(span)
        .await
    }

    /// The registered worker id (this process's pid).
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Refresh the heartbeat immediately instead of waiting for the next tick.
    #[must_use]
    pub fn beat(&self) -> bool {
        self.supervisor.heartbeat().refresh(&self.worker_id)
    }

    /// Replace the session payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was reclaimed or deleted.
    pub fn update_payload(&self, payload: Payload) -> Result<SessionRecord> {
        self.supervisor
            .sessions()
            .update_payload(&self.worker_id, payload)
    }

    /// Record an informative status change.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was reclaimed or deleted.
    pub fn set_status(&self, status: SessionStatus) -> Result<SessionRecord> {
        self.supervisor
            .sessions()
            .set_status(&self.worker_id, status)
    }

    /// Stop heartbeating and delete the session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the record cannot be removed.
    pub async fn shutdown(mut self) -> Result<()> {
        let span = info_span!("worker_shutdown", worker_id = %self.worker_id);

        async move {
            if let Err(err) = self.set_status(SessionStatus::Stopping) {
                warn!(%err, "could not mark session as stopping");
            }

            self.cancel.cancel();
            if let Some(handle) = self.heartbeat_handle.take() {
                if let Err(err) = handle.await {
                    warn!(%err, "heartbeat task ended abnormally");
                }
            }

            let removed = self.supervisor.sessions().delete(&self.worker_id)?;
            info!(removed, "worker session shut down");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
