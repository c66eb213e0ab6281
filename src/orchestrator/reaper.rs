//! Stale session reaper.
//!
//! A sweep walks every session record and reclaims only those whose worker
//! is both dead (liveness oracle) and silent (heartbeat staleness). Age
//! alone never reclaims a record, and neither does apparent death alone.
//! Legacy records, whose ids cannot be probed, are reclaimed once they
//! outlive the configured grace window. Pid-named records that no longer
//! decode are judged by their pid and their file age.
//!
//! Before a record is deleted the registered [`SessionCapture`] receives
//! its payload. Capture is best-effort: a failed or slow capture is logged
//! and deletion proceeds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ReaperConfig;
use crate::models::session::{parse_pid, SessionRecord};
use crate::persistence::record_file;
use crate::persistence::session_repo::{EntryKind, SessionEntry, SessionRepo};
use crate::Result;

use super::heartbeat::HeartbeatProtocol;
use super::liveness::LivenessOracle;

/// Default bound on a single capture callback.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a record was reclaimed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// Worker is dead and its heartbeat is stale.
    Abandoned,
    /// Record uses the legacy id format.
    Legacy,
    /// Record body does not decode, its pid is dead, and the file is older
    /// than the pre-heartbeat age ceiling.
    Unreadable,
}

/// Assessment of one record during a sweep.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Alive with a fresh heartbeat.
    Healthy,
    /// Alive but silent: idle, not crashed. Kept.
    IdleAlive,
    /// Dead but heartbeat still fresh: kept so the worker can resume.
    Grace,
    /// Dead and stale: reclaimed.
    Abandoned,
    /// Legacy id past its grace window: reclaimed.
    Legacy,
    /// Legacy id still inside its grace window: kept.
    LegacyGrace,
    /// Record body could not be decoded and its owner may be around:
    /// logged and kept.
    Unreadable,
    /// Undecodable record, dead pid, file untouched past the pre-heartbeat
    /// age ceiling: reclaimed.
    UnreadableAbandoned,
}

impl Verdict {
    /// The reclaim reason, if this verdict authorizes deletion.
    #[must_use]
    pub fn reclaim_reason(self) -> Option<ReclaimReason> {
        match self {
            Self::Abandoned => Some(ReclaimReason::Abandoned),
            Self::Legacy => Some(ReclaimReason::Legacy),
            Self::UnreadableAbandoned => Some(ReclaimReason::Unreadable),
            _ => None,
        }
    }
}

/// Session context handed to the capture callback before deletion.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CapturedSession {
    /// Worker id of the reclaimed record.
    pub worker_id: String,
    /// Why the record is being reclaimed.
    pub reason: ReclaimReason,
    /// Full payload (for legacy records, whatever JSON could be recovered).
    pub payload: serde_json::Value,
    /// Creation time, when known.
    pub created_at: Option<DateTime<Utc>>,
    /// Last heartbeat, when known.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Callback that preserves a session's context before the reaper deletes it.
pub trait SessionCapture: Send + Sync {
    /// Persist `session` somewhere durable.
    fn capture<'a>(
        &'a self,
        session: &'a CapturedSession,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Adapter turning an async closure into a [`SessionCapture`].
pub struct FnCapture<F>(pub F);

impl<F, Fut> SessionCapture for FnCapture<F>
where
    F: Fn(CapturedSession) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn capture<'a>(
        &'a self,
        session: &'a CapturedSession,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin((self.0)(session.clone()))
    }
}

/// Notifications published for downstream logging.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaperEvent {
    /// A record was deleted.
    Reclaimed {
        /// Worker id of the deleted record.
        worker_id: String,
        /// Why it was deleted.
        reason: ReclaimReason,
    },
    /// The capture callback failed; the record was deleted anyway.
    CaptureFailed {
        /// Worker id of the affected record.
        worker_id: String,
        /// Rendered failure.
        error: String,
    },
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Records examined.
    pub scanned: usize,
    /// Worker ids whose records were deleted.
    pub reclaimed: Vec<String>,
    /// Records kept.
    pub retained: usize,
    /// Records skipped because of an error.
    pub errors: usize,
}

/// Periodic or opportunistic sweeper over the session store.
pub struct Reaper {
    repo: SessionRepo,
    heartbeat: HeartbeatProtocol,
    oracle: Arc<LivenessOracle>,
    config: ReaperConfig,
    capture: Option<Arc<dyn SessionCapture>>,
    capture_timeout: Duration,
    events: Option<mpsc::Sender<ReaperEvent>>,
}

impl Reaper {
    /// Construct a reaper with no capture callback and no event channel.
    #[must_use]
    pub fn new(
        repo: SessionRepo,
        heartbeat: HeartbeatProtocol,
        oracle: Arc<LivenessOracle>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            repo,
            heartbeat,
            oracle,
            config,
            capture: None,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            events: None,
        }
    }

    /// Register the callback invoked before each deletion.
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn SessionCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Bound each capture call.
    #[must_use]
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    /// Publish [`ReaperEvent`]s on `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<ReaperEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Assess one scanned entry without side effects.
    pub async fn assess(&self, entry: &SessionEntry) -> Verdict {
        match &entry.kind {
            EntryKind::Current(record) => self.assess_record(record).await,
            EntryKind::Legacy { .. } => {
                let age = entry
                    .modified_at
                    .map(|modified| Utc::now().signed_duration_since(modified));
                let grace =
                    TimeDelta::from_std(self.config.legacy_grace()).unwrap_or(TimeDelta::MAX);
                match age {
                    Some(age) if age < grace => Verdict::LegacyGrace,
                    _ => Verdict::Legacy,
                }
            }
            EntryKind::Unreadable { .. } => {
                // No heartbeat to read: the file's own age stands in for it.
                let ceiling = TimeDelta::from_std(self.heartbeat.legacy_max_age()).ok();
                let stale = match (entry.modified_at, ceiling) {
                    (Some(modified), Some(ceiling)) => {
                        Utc::now().signed_duration_since(modified) > ceiling
                    }
                    _ => false,
                };
                if stale && !self.owner_alive(&entry.worker_id).await {
                    Verdict::UnreadableAbandoned
                } else {
                    Verdict::Unreadable
                }
            }
        }
    }

    async fn assess_record(&self, record: &SessionRecord) -> Verdict {
        let Some(pid) = record.pid() else {
            return Verdict::Legacy;
        };

        let alive = self.worker_alive(pid).await;
        let stale = self.heartbeat.is_stale(record);

        match (alive, stale) {
            (true, false) => Verdict::Healthy,
            (true, true) => Verdict::IdleAlive,
            (false, false) => Verdict::Grace,
            (false, true) => Verdict::Abandoned,
        }
    }

    /// Existence probe, narrowed by the identity check when configured.
    async fn worker_alive(&self, pid: i32) -> bool {
        if !self.oracle.is_alive(pid) {
            return false;
        }
        match (
            self.config.verify_identity,
            self.config.expected_signature.as_deref(),
        ) {
            (true, Some(signature)) => self.oracle.verify_identity(pid, signature).await,
            _ => true,
        }
    }

    async fn owner_alive(&self, worker_id: &str) -> bool {
        match parse_pid(worker_id) {
            Some(pid) => self.worker_alive(pid).await,
            None => false,
        }
    }

    /// Run one sweep over every record.
    ///
    /// Per-record failures are logged and counted; they never abort the sweep.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` only if the session directory cannot be listed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let span = info_span!("reaper_sweep");
        async move {
            let entries = self.repo.list()?;
            let mut report = SweepReport {
                scanned: entries.len(),
                ..SweepReport::default()
            };

            for entry in &entries {
                let verdict = self.assess(entry).await;
                debug!(worker_id = %entry.worker_id, ?verdict, "record assessed");

                let Some(reason) = verdict.reclaim_reason() else {
                    if let EntryKind::Unreadable { reason, .. } = &entry.kind {
                        warn!(
                            worker_id = %entry.worker_id,
                            %reason,
                            "keeping unreadable session record"
                        );
                        report.errors += 1;
                    } else {
                        report.retained += 1;
                    }
                    continue;
                };

                match self.reclaim(entry, reason).await {
                    Ok(true) => report.reclaimed.push(entry.worker_id.clone()),
                    Ok(false) => report.retained += 1,
                    Err(err) => {
                        error!(
                            worker_id = %entry.worker_id,
                            %err,
                            "failed to reclaim session record"
                        );
                        report.errors += 1;
                    }
                }
            }

            info!(
                scanned = report.scanned,
                reclaimed = report.reclaimed.len(),
                retained = report.retained,
                errors = report.errors,
                "sweep complete"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Capture then delete one record. Returns whether this call removed it.
    ///
    /// The record is re-checked before the capture and again right before
    /// deletion, since a new owner of the pid may register while the
    /// capture runs.
    async fn reclaim(&self, entry: &SessionEntry, reason: ReclaimReason) -> Result<bool> {
        if !self.still_reclaimable(entry).await? {
            return Ok(false);
        }

        self.run_capture(&captured_session(entry, reason)).await;

        if !self.still_reclaimable(entry).await? {
            return Ok(false);
        }

        let removed = self.repo.remove_entry(entry)?;
        if removed {
            info!(worker_id = %entry.worker_id, ?reason, "session reclaimed");
            self.publish(ReaperEvent::Reclaimed {
                worker_id: entry.worker_id.clone(),
                reason,
            })
            .await;
        }
        Ok(removed)
    }

    /// Whether the record on disk is still the one assessed and its owner
    /// is still gone.
    async fn still_reclaimable(&self, entry: &SessionEntry) -> Result<bool> {
        match &entry.kind {
            EntryKind::Current(record) => {
                let Some(current) = self.repo.get(&record.worker_id)? else {
                    return Ok(false);
                };
                if current.last_heartbeat != record.last_heartbeat
                    || current.created_at != record.created_at
                {
                    info!(
                        worker_id = %record.worker_id,
                        "session record changed during sweep, keeping it"
                    );
                    return Ok(false);
                }
                Ok(!self.owner_alive(&record.worker_id).await)
            }
            EntryKind::Unreadable { .. } => {
                if !file_unchanged(entry) {
                    return Ok(false);
                }
                Ok(!self.owner_alive(&entry.worker_id).await)
            }
            EntryKind::Legacy { .. } => Ok(file_unchanged(entry)),
        }
    }

    async fn run_capture(&self, captured: &CapturedSession) {
        let Some(ref capture) = self.capture else {
            return;
        };

        let attempt = tokio::time::timeout(self.capture_timeout, capture.capture(captured));
        let failure = match attempt.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!(
                "capture timed out after {}ms",
                self.capture_timeout.as_millis()
            )),
        };

        if let Some(error) = failure {
            warn!(
                worker_id = %captured.worker_id,
                %error,
                "session capture failed, deleting anyway"
            );
            self.publish(ReaperEvent::CaptureFailed {
                worker_id: captured.worker_id.clone(),
                error,
            })
            .await;
        }
    }

    async fn publish(&self, event: ReaperEvent) {
        if let Some(ref tx) = self.events {
            if tx.send(event).await.is_err() {
                debug!("reaper event receiver dropped");
            }
        }
    }
}

/// Whether the file behind `entry` still has the mtime seen at scan time.
fn file_unchanged(entry: &SessionEntry) -> bool {
    let modified = record_file::modified_at(&entry.path);
    if modified.is_some() && modified == entry.modified_at {
        return true;
    }
    info!(worker_id = %entry.worker_id, "session file changed during sweep, keeping it");
    false
}

fn captured_session(entry: &SessionEntry, reason: ReclaimReason) -> CapturedSession {
    match &entry.kind {
        EntryKind::Current(record) => CapturedSession {
            worker_id: record.worker_id.clone(),
            reason,
            payload: serde_json::Value::Object(record.payload.clone()),
            created_at: Some(record.created_at),
            last_heartbeat: record.last_heartbeat,
        },
        EntryKind::Legacy { payload } | EntryKind::Unreadable { payload, .. } => {
            CapturedSession {
                worker_id: entry.worker_id.clone(),
                reason,
                payload: payload.clone().unwrap_or(serde_json::Value::Null),
                created_at: None,
                last_heartbeat: None,
            }
        }
    }
}

/// Spawn a background task that sweeps every `interval` until `cancel` fires.
#[must_use]
pub fn spawn_reaper_task(
    reaper: Arc<Reaper>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reaper task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = reaper.sweep().await {
                        error!(%err, "reaper sweep failed");
                    }
                }
            }
        }
    })
}
