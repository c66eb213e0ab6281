//! Session record store backed by one JSON file per worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::models::session::{is_legacy_id, validate_key, Payload, SessionRecord, SessionStatus};
use crate::{AppError, Result};

use super::db::StateDir;
use super::record_file;

const FILE_PREFIX: &str = "session_";
const FILE_SUFFIX: &str = ".json";

/// Result of an idempotent [`SessionRepo::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new record was written.
    Created(SessionRecord),
    /// A record already existed for this worker id; nothing was written.
    AlreadyExists(SessionRecord),
}

impl CreateOutcome {
    /// The record now on disk.
    #[must_use]
    pub fn record(&self) -> &SessionRecord {
        match self {
            Self::Created(record) | Self::AlreadyExists(record) => record,
        }
    }

    /// Whether this call created the record.
    #[must_use]
    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Structural classification of a record file found during a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// Current-format record with a pid worker id.
    Current(SessionRecord),
    /// Legacy record: the id is not a pid, so liveness cannot be checked.
    Legacy {
        /// Best-effort payload recovered from the file, if it was JSON.
        payload: Option<serde_json::Value>,
    },
    /// A pid-named file whose body does not decode as a current record.
    ///
    /// The reaper judges it by the pid in its file name and its file age.
    Unreadable {
        /// Decode or read failure.
        reason: String,
        /// Best-effort JSON recovered from the file, if it parsed at all.
        payload: Option<serde_json::Value>,
    },
}

/// One record file discovered by [`SessionRepo::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    /// Worker id taken from the file name.
    pub worker_id: String,
    /// Absolute path of the record file.
    pub path: PathBuf,
    /// File modification time, used to age legacy records.
    pub modified_at: Option<DateTime<Utc>>,
    /// Structural classification.
    pub kind: EntryKind,
}

/// Store for [`SessionRecord`]s under `<state>/sessions`.
///
/// Clones share one update lock, so a worker's heartbeat task and its own
/// payload updates never overwrite each other.
#[derive(Debug, Clone)]
pub struct SessionRepo {
    dir: PathBuf,
    heartbeat_interval: Duration,
    update_lock: Arc<Mutex<()>>,
}

impl SessionRepo {
    /// Create a repository whose new records advertise `heartbeat_interval`.
    #[must_use]
    pub fn new(state: &StateDir, heartbeat_interval: Duration) -> Self {
        Self {
            dir: state.sessions(),
            heartbeat_interval,
            update_lock: Arc::default(),
        }
    }

    /// Heartbeat interval written into new records.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Path of the record file for `worker_id`.
    #[must_use]
    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{worker_id}{FILE_SUFFIX}"))
    }

    /// Register a worker. Idempotent: an existing record is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRecord` if `worker_id` is not a pid, or
    /// `AppError::Store` if the record cannot be written.
    pub fn create(&self, worker_id: &str, payload: Payload) -> Result<CreateOutcome> {
        let _span = info_span!("session_create", worker_id).entered();

        validate_key(worker_id)?;
        if is_legacy_id(worker_id) {
            return Err(AppError::InvalidRecord(format!(
                "worker id {worker_id:?} is not a pid; new records must use numeric ids"
            )));
        }

        let record = SessionRecord::new(worker_id.to_owned(), payload, self.heartbeat_interval);
        let path = self.path_for(worker_id);

        if record_file::create_json_exclusive(&path, &record)? {
            info!(worker_id, "session record created");
            return Ok(CreateOutcome::Created(record));
        }

        debug!(worker_id, "session record already exists");
        match self.get(worker_id)? {
            Some(existing) => Ok(CreateOutcome::AlreadyExists(existing)),
            // Lost a race with a concurrent delete; the caller can retry.
            None => Err(AppError::Store(format!(
                "session record for {worker_id} vanished during create"
            ))),
        }
    }

    /// Fetch a record by worker id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serde` if the record exists but does not decode.
    pub fn get(&self, worker_id: &str) -> Result<Option<SessionRecord>> {
        validate_key(worker_id)?;
        record_file::read_json(&self.path_for(worker_id))
    }

    /// Atomically replace a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub fn put(&self, record: &SessionRecord) -> Result<()> {
        validate_key(&record.worker_id)?;
        record_file::write_json_atomic(&self.path_for(&record.worker_id), record)
    }

    /// Set `last_heartbeat` to `at`. Returns `Ok(None)` if the record is missing.
    ///
    /// Records that predate heartbeats gain the repository's interval.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the record cannot be read or rewritten.
    pub fn update_heartbeat(
        &self,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        let _guard = self.lock_updates();
        let Some(mut record) = self.get(worker_id)? else {
            return Ok(None);
        };
        record.last_heartbeat = Some(at);
        if record.heartbeat_interval_seconds.is_none() {
            record.heartbeat_interval_seconds = Some(self.heartbeat_interval.as_secs());
        }
        self.put(&record)?;
        Ok(Some(record))
    }

    /// Replace the opaque payload of a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists for `worker_id`.
    pub fn update_payload(&self, worker_id: &str, payload: Payload) -> Result<SessionRecord> {
        let _guard = self.lock_updates();
        let mut record = self.require(worker_id)?;
        record.payload = payload;
        self.put(&record)?;
        Ok(record)
    }

    /// Update the worker-reported status of a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists for `worker_id`.
    pub fn set_status(&self, worker_id: &str, status: SessionStatus) -> Result<SessionRecord> {
        let _guard = self.lock_updates();
        let mut record = self.require(worker_id)?;
        record.status = status;
        self.put(&record)?;
        Ok(record)
    }

    /// Delete a record. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file exists but cannot be removed.
    pub fn delete(&self, worker_id: &str) -> Result<bool> {
        validate_key(worker_id)?;
        let removed = record_file::remove(&self.path_for(worker_id))?;
        if removed {
            info!(worker_id, "session record deleted");
        }
        Ok(removed)
    }

    /// Delete the file behind a scanned entry. Works for legacy ids that are
    /// not valid keys. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file exists but cannot be removed.
    pub fn remove_entry(&self, entry: &SessionEntry) -> Result<bool> {
        if entry.path.parent() != Some(self.dir.as_path()) {
            return Err(AppError::InvalidRecord(format!(
                "{} is outside the session store",
                entry.path.display()
            )));
        }
        let removed = record_file::remove(&entry.path)?;
        if removed {
            info!(worker_id = %entry.worker_id, "session record removed");
        }
        Ok(removed)
    }

    /// Enumerate every record file, including legacy and unreadable ones.
    ///
    /// Entries are sorted by worker id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the sessions directory cannot be read.
    pub fn list(&self) -> Result<Vec<SessionEntry>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            AppError::Store(format!("cannot read {}: {err}", self.dir.display()))
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let Some(worker_id) = worker_id_from_path(&path) else {
                continue;
            };
            let Some(kind) = classify(&path, &worker_id) else {
                continue;
            };
            found.push(SessionEntry {
                modified_at: record_file::modified_at(&path),
                worker_id,
                path,
                kind,
            });
        }

        found.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(found)
    }

    fn lock_updates(&self) -> MutexGuard<'_, ()> {
        self.update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn require(&self, worker_id: &str) -> Result<SessionRecord> {
        self.get(worker_id)?
            .ok_or_else(|| AppError::NotFound(format!("session {worker_id} not found")))
    }
}

/// Extract the worker id from a `session_<id>.json` path.
fn worker_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    (!id.is_empty()).then(|| id.to_owned())
}

/// Classify a record file; `None` when it vanished mid-scan.
fn classify(path: &Path, worker_id: &str) -> Option<EntryKind> {
    if is_legacy_id(worker_id) {
        let payload = recover_payload(path);
        return path.exists().then_some(EntryKind::Legacy { payload });
    }

    match record_file::read_json::<SessionRecord>(path) {
        Ok(Some(record)) if record.worker_id == worker_id => Some(EntryKind::Current(record)),
        Ok(Some(record)) => Some(EntryKind::Unreadable {
            reason: format!(
                "file name id {worker_id} does not match record id {}",
                record.worker_id
            ),
            payload: Some(serde_json::Value::Object(record.payload)),
        }),
        Ok(None) => None,
        Err(err) => Some(EntryKind::Unreadable {
            reason: err.to_string(),
            payload: recover_payload(path),
        }),
    }
}

/// Whatever JSON a non-current record holds, preferring its `payload` field.
fn recover_payload(path: &Path) -> Option<serde_json::Value> {
    record_file::read_json::<serde_json::Value>(path)
        .ok()
        .flatten()
        .map(|value| match value.get("payload") {
            Some(inner) => inner.clone(),
            None => value,
        })
}
