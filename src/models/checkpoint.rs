//! Checkpoint model for multi-stage task progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest completed stage of a multi-stage task. One per task id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Owning task identifier.
    pub task_id: String,
    /// Name of the last completed stage.
    pub stage: String,
    /// Time the stage was recorded.
    pub timestamp: DateTime<Utc>,
    /// Opaque stage output carried into the next stage.
    #[serde(rename = "data", default)]
    pub stage_data: serde_json::Value,
    /// Task-level restart counter.
    #[serde(default)]
    pub retry_count: u32,
}

impl Checkpoint {
    /// Construct a checkpoint stamped with the current time.
    #[must_use]
    pub fn new(
        task_id: String,
        stage: String,
        stage_data: serde_json::Value,
        retry_count: u32,
    ) -> Self {
        Self {
            task_id,
            stage,
            timestamp: Utc::now(),
            stage_data,
            retry_count,
        }
    }
}
