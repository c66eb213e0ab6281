//! State directory layout and bootstrap.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

const SESSIONS_DIR: &str = "sessions";
const CHECKPOINTS_DIR: &str = "checkpoints";

/// Root of the on-disk record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `session_<worker_id>.json` records.
    #[must_use]
    pub fn sessions(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    /// Directory holding `checkpoint_<task_key>.json` records.
    #[must_use]
    pub fn checkpoints(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }
}

/// Open (creating if needed) the state directory tree under `root`.
///
/// Safe to call on every startup; existing records are left untouched.
///
/// # Errors
///
/// Returns `AppError::Store` if a directory cannot be created.
pub fn connect(root: impl AsRef<Path>) -> Result<StateDir> {
    let state = StateDir {
        root: root.as_ref().to_path_buf(),
    };
    for dir in [state.sessions(), state.checkpoints()] {
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Store(format!("failed to create {}: {err}", dir.display()))
        })?;
    }
    debug!(root = %state.root.display(), "state directory ready");
    Ok(state)
}
