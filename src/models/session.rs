//! Session record model and worker identifier helpers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Opaque worker payload; the supervisor never inspects its contents.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Worker-reported lifecycle status. Informational only; the reaper never
/// uses it to authorize deletion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Worker is executing work.
    #[default]
    Active,
    /// Worker is alive but waiting for work.
    Idle,
    /// Worker began a clean shutdown.
    Stopping,
}

/// Durable per-worker session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Stable worker identifier (the worker's pid).
    pub worker_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat; absent on records written before heartbeats existed.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Expected refresh interval; absent on pre-heartbeat records.
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
    /// Opaque worker context, handed to the capture callback on reclaim.
    #[serde(default)]
    pub payload: Payload,
    /// Worker-reported status.
    #[serde(default)]
    pub status: SessionStatus,
}

impl SessionRecord {
    /// Construct a fresh record with its first heartbeat set to now.
    #[must_use]
    pub fn new(worker_id: String, payload: Payload, heartbeat_interval: Duration) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            created_at: now,
            last_heartbeat: Some(now),
            heartbeat_interval_seconds: Some(heartbeat_interval.as_secs()),
            payload,
            status: SessionStatus::Active,
        }
    }

    /// The worker's pid, when the identifier is numeric.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        parse_pid(&self.worker_id)
    }

    /// Expected heartbeat interval, when the record carries one.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_seconds.map(Duration::from_secs)
    }

    /// Whether this record predates the heartbeat fields.
    #[must_use]
    pub fn is_pre_heartbeat(&self) -> bool {
        self.last_heartbeat.is_none() || self.heartbeat_interval_seconds.is_none()
    }
}

/// Parse a worker identifier as a positive pid.
#[must_use]
pub fn parse_pid(worker_id: &str) -> Option<i32> {
    if worker_id.is_empty() || !worker_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    worker_id.parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// Whether an identifier is in the legacy (non-pid) format.
#[must_use]
pub fn is_legacy_id(worker_id: &str) -> bool {
    parse_pid(worker_id).is_none()
}

/// Validate that an identifier is safe to embed in a record file name.
///
/// # Errors
///
/// Returns `AppError::InvalidRecord` for empty identifiers or identifiers
/// containing characters outside `[A-Za-z0-9_.-]`.
pub fn validate_key(worker_id: &str) -> Result<()> {
    let valid = !worker_id.is_empty()
        && worker_id != "."
        && worker_id != ".."
        && worker_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidRecord(format!(
            "worker id {worker_id:?} is not a valid record key"
        )))
    }
}

/// Identifier of the current process in worker-id form.
#[must_use]
pub fn current_worker_id() -> String {
    std::process::id().to_string()
}
