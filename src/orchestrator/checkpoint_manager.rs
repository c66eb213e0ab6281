//! Checkpoint save, load, and garbage collection for multi-stage tasks.
//!
//! A task has at most one checkpoint: each [`CheckpointManager::save`]
//! overwrites the previous stage atomically, so after a crash
//! [`CheckpointManager::load`] returns exactly the last stage that was
//! saved successfully.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{info, info_span, warn};

use crate::models::checkpoint::Checkpoint;
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::Result;

/// Stage name recorded when a task failed before completing any stage.
pub const NO_STAGE: &str = "";

/// Owner of checkpoint persistence.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    repo: CheckpointRepo,
}

impl CheckpointManager {
    /// Create a manager over `repo`.
    #[must_use]
    pub fn new(repo: CheckpointRepo) -> Self {
        Self { repo }
    }

    /// Record `stage` as the latest completed stage of `task_id`.
    ///
    /// Replaces any previous checkpoint; the retry counter carries over.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the checkpoint cannot be written.
    pub fn save(
        &self,
        task_id: &str,
        stage: &str,
        stage_data: serde_json::Value,
    ) -> Result<Checkpoint> {
        let _span = info_span!("checkpoint_save", task_id, stage).entered();

        let retry_count = self.retry_count(task_id);
        let checkpoint =
            Checkpoint::new(task_id.to_owned(), stage.to_owned(), stage_data, retry_count);
        self.repo.upsert(&checkpoint)?;

        info!(task_id, stage, retry_count, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Load the checkpoint for `task_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serde` if the stored checkpoint does not decode.
    pub fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        self.repo.get(task_id)
    }

    /// Remove the checkpoint after the task succeeded. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file cannot be removed.
    pub fn clear(&self, task_id: &str) -> Result<bool> {
        let removed = self.repo.delete(task_id)?;
        if removed {
            info!(task_id, "checkpoint cleared");
        }
        Ok(removed)
    }

    /// Bump the task's retry counter and return the new value.
    ///
    /// A task without a checkpoint gets one at [`NO_STAGE`].
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the checkpoint cannot be read or written.
    pub fn increment_retry(&self, task_id: &str) -> Result<u32> {
        let mut checkpoint = self.load(task_id)?.unwrap_or_else(|| {
            Checkpoint::new(
                task_id.to_owned(),
                NO_STAGE.to_owned(),
                serde_json::Value::Null,
                0,
            )
        });
        checkpoint.retry_count = checkpoint.retry_count.saturating_add(1);
        checkpoint.timestamp = Utc::now();
        self.repo.upsert(&checkpoint)?;

        info!(task_id, retry_count = checkpoint.retry_count, "checkpoint retry incremented");
        Ok(checkpoint.retry_count)
    }

    /// Whether `task_id` has used up `max_retries` restarts.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the checkpoint cannot be read.
    pub fn should_give_up(&self, task_id: &str, max_retries: u32) -> Result<bool> {
        Ok(self
            .load(task_id)?
            .is_some_and(|checkpoint| checkpoint.retry_count >= max_retries))
    }

    /// All stored checkpoints, sorted by task id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the checkpoint directory cannot be read.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        self.repo.list()
    }

    /// Delete checkpoints whose timestamp is older than `max_age`, whatever
    /// their stage. Returns the task ids removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the checkpoint directory cannot be read.
    pub fn cleanup_old(&self, max_age: Duration) -> Result<Vec<String>> {
        let _span = info_span!("checkpoint_cleanup", max_age_secs = max_age.as_secs()).entered();

        let Ok(max_age) = TimeDelta::from_std(max_age) else {
            return Ok(Vec::new());
        };
        let now = Utc::now();

        let mut removed = Vec::new();
        for checkpoint in self.repo.list()? {
            if now.signed_duration_since(checkpoint.timestamp) <= max_age {
                continue;
            }
            match self.repo.delete(&checkpoint.task_id) {
                Ok(true) => removed.push(checkpoint.task_id),
                Ok(false) => {}
                Err(err) => {
                    warn!(task_id = %checkpoint.task_id, %err, "failed to remove old checkpoint");
                }
            }
        }

        info!(removed = removed.len(), "old checkpoints cleaned up");
        Ok(removed)
    }

    fn retry_count(&self, task_id: &str) -> u32 {
        match self.repo.get(task_id) {
            Ok(existing) => existing.map_or(0, |checkpoint| checkpoint.retry_count),
            Err(err) => {
                warn!(task_id, %err, "previous checkpoint unreadable, resetting retry count");
                0
            }
        }
    }
}
