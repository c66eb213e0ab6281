//! Checkpoint store: one JSON file per task, replaced atomically.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::models::checkpoint::Checkpoint;
use crate::{AppError, Result};

use super::db::StateDir;
use super::record_file;

const FILE_PREFIX: &str = "checkpoint_";
const FILE_SUFFIX: &str = ".json";

/// Store for [`Checkpoint`]s under `<state>/checkpoints`.
#[derive(Debug, Clone)]
pub struct CheckpointRepo {
    dir: PathBuf,
}

impl CheckpointRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(state: &StateDir) -> Self {
        Self {
            dir: state.checkpoints(),
        }
    }

    /// Path of the checkpoint file for `task_id`.
    #[must_use]
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", task_key(task_id)))
    }

    /// Atomically write `checkpoint`, replacing any previous one for its task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRecord` for an empty task id, or
    /// `AppError::Store` if the write fails.
    pub fn upsert(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.task_id.is_empty() {
            return Err(AppError::InvalidRecord("task id must not be empty".into()));
        }
        record_file::write_json_atomic(&self.path_for(&checkpoint.task_id), checkpoint)
    }

    /// Retrieve the checkpoint for a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serde` if the stored checkpoint does not decode.
    pub fn get(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        record_file::read_json(&self.path_for(task_id))
    }

    /// Delete the checkpoint for a task. Returns `false` if none existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file cannot be removed.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        record_file::remove(&self.path_for(task_id))
    }

    /// List every decodable checkpoint, sorted by task id.
    ///
    /// Undecodable files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            AppError::Store(format!("cannot read {}: {err}", self.dir.display()))
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
            if !is_record {
                continue;
            }
            match record_file::read_json::<Checkpoint>(&path) {
                Ok(Some(checkpoint)) => checkpoints.push(checkpoint),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(checkpoints)
    }
}

/// Encode a task id into a file-name-safe key.
///
/// Bytes outside `[A-Za-z0-9_.-]` become `%XX`; a leading `.` is encoded too
/// so keys never collide with temp files.
#[must_use]
pub fn task_key(task_id: &str) -> String {
    let mut key = String::with_capacity(task_id.len());
    for (idx, byte) in task_id.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && idx > 0);
        if safe {
            key.push(char::from(byte));
        } else {
            let _ = write!(key, "%{byte:02X}");
        }
    }
    key
}
