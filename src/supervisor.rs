//! Per-process supervisor context.
//!
//! Bundles configuration, the session and checkpoint stores, the liveness
//! oracle, and the heartbeat protocol. Built once at startup and passed by
//! reference; nothing here is global.

use std::sync::Arc;

use tracing::info;

use crate::config::SupervisorConfig;
use crate::orchestrator::checkpoint_manager::CheckpointManager;
use crate::orchestrator::heartbeat::HeartbeatProtocol;
use crate::orchestrator::liveness::LivenessOracle;
use crate::orchestrator::reaper::Reaper;
use crate::orchestrator::recovery::RecoveryEngine;
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::{db, StateDir};
use crate::Result;

/// Shared supervisor state.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    state: StateDir,
    sessions: SessionRepo,
    checkpoints: CheckpointManager,
    heartbeat: HeartbeatProtocol,
    oracle: Arc<LivenessOracle>,
}

impl Supervisor {
    /// Validate `config`, create the state directory, and wire the components.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails or `AppError::Store`
    /// if the state directory cannot be created.
    pub fn open(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let state = db::connect(config.resolve_state_dir())?;

        let sessions = SessionRepo::new(&state, config.heartbeat.interval());
        let checkpoints = CheckpointManager::new(CheckpointRepo::new(&state));
        let heartbeat = HeartbeatProtocol::new(sessions.clone(), &config.heartbeat);
        let oracle = Arc::new(LivenessOracle::new(config.reaper.probe_timeout()));

        info!(state_dir = %state.root().display(), "supervisor opened");
        Ok(Self {
            config: Arc::new(config),
            state,
            sessions,
            checkpoints,
            heartbeat,
            oracle,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// State directory layout.
    #[must_use]
    pub fn state_dir(&self) -> &StateDir {
        &self.state
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }

    /// Checkpoint manager.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Heartbeat protocol.
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatProtocol {
        &self.heartbeat
    }

    /// Liveness oracle shared by every reaper built from this context.
    #[must_use]
    pub fn oracle(&self) -> &Arc<LivenessOracle> {
        &self.oracle
    }

    /// A reaper over this context's stores, without capture or events.
    #[must_use]
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.sessions.clone(),
            self.heartbeat.clone(),
            Arc::clone(&self.oracle),
            self.config.reaper.clone(),
        )
    }

    /// A fresh recovery engine with the configured retry policy.
    #[must_use]
    pub fn recovery_engine(&self) -> RecoveryEngine {
        RecoveryEngine::from_config(&self.config.retry)
    }
}
