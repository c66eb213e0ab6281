//! Heartbeat protocol: refresh a worker's liveness timestamp and judge
//! staleness from missed intervals.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::models::session::SessionRecord;
use crate::persistence::session_repo::SessionRepo;

/// Refreshes heartbeats and answers staleness questions.
#[derive(Debug, Clone)]
pub struct HeartbeatProtocol {
    repo: SessionRepo,
    max_missed: u32,
    legacy_max_age: Duration,
}

impl HeartbeatProtocol {
    /// Build a protocol over `repo` with thresholds from `config`.
    #[must_use]
    pub fn new(repo: SessionRepo, config: &HeartbeatConfig) -> Self {
        Self {
            repo,
            max_missed: config.max_missed,
            legacy_max_age: config.legacy_max_age(),
        }
    }

    /// Age ceiling for records without heartbeat fields.
    #[must_use]
    pub fn legacy_max_age(&self) -> Duration {
        self.legacy_max_age
    }

    /// Default missed-heartbeat tolerance.
    #[must_use]
    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Set the worker's `last_heartbeat` to now.
    ///
    /// Never fails: a missing record is a no-op and store errors are logged.
    /// Returns whether a record was refreshed.
    #[must_use]
    pub fn refresh(&self, worker_id: &str) -> bool {
        match self.repo.update_heartbeat(worker_id, Utc::now()) {
            Ok(Some(_)) => {
                debug!(worker_id, "heartbeat refreshed");
                true
            }
            Ok(None) => {
                debug!(worker_id, "heartbeat skipped, no session record");
                false
            }
            Err(err) => {
                warn!(worker_id, %err, "heartbeat refresh failed");
                false
            }
        }
    }

    /// Whether `record` has missed more than the default number of heartbeats.
    #[must_use]
    pub fn is_stale(&self, record: &SessionRecord) -> bool {
        self.is_stale_with(record, self.max_missed)
    }

    /// Whether `record` has missed more than `max_missed` heartbeats.
    #[must_use]
    pub fn is_stale_with(&self, record: &SessionRecord, max_missed: u32) -> bool {
        is_stale_at(record, max_missed, self.legacy_max_age, Utc::now())
    }
}

/// Pure staleness rule evaluated at `now`.
///
/// Stale iff `now - last_heartbeat > heartbeat_interval * max_missed`.
/// Records without heartbeat fields fall back to `now - created_at >
/// legacy_max_age`. A threshold too large to represent is never exceeded.
#[must_use]
pub fn is_stale_at(
    record: &SessionRecord,
    max_missed: u32,
    legacy_max_age: Duration,
    now: DateTime<Utc>,
) -> bool {
    let (since, threshold) = match (record.last_heartbeat, record.heartbeat_interval()) {
        (Some(last), Some(interval)) => (last, interval.checked_mul(max_missed)),
        _ => (record.created_at, Some(legacy_max_age)),
    };

    let Some(threshold) = threshold.and_then(|t| TimeDelta::from_std(t).ok()) else {
        return false;
    };
    now.signed_duration_since(since) > threshold
}

/// Spawn a background task that refreshes `worker_id` every `interval`
/// until `cancel` fires. Each refresh runs on the blocking pool.
#[must_use]
pub fn spawn_heartbeat_task(
    protocol: HeartbeatProtocol,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(worker_id, "heartbeat task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // Read, fsync, and rename run off the async workers.
                    let beat = protocol.clone();
                    let id = worker_id.clone();
                    let refresh = tokio::task::spawn_blocking(move || beat.refresh(&id));
                    if let Err(err) = refresh.await {
                        warn!(worker_id, %err, "heartbeat refresh task failed");
                    }
                }
            }
        }
    })
}
