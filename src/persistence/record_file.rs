//! Atomic record-file primitives.
//!
//! Every write lands in a `tempfile::NamedTempFile` beside the target and
//! is then renamed over it (`persist`), so a crash mid-write leaves the
//! previous record intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// # Errors
///
/// Returns `AppError::Serde` if encoding fails, or `AppError::Store` on
/// temp-file creation, write, sync, or rename failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = stage(path, value)?;
    tmp.persist(path).map_err(|err| {
        AppError::Store(format!("failed to persist {}: {}", path.display(), err.error))
    })?;
    Ok(())
}

/// Atomically create `path` only if it does not exist yet.
///
/// Returns `false` when another writer already created the record.
///
/// # Errors
///
/// Returns `AppError::Serde` if encoding fails, or `AppError::Store` on any
/// I/O failure other than "already exists".
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let tmp = stage(path, value)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(AppError::Store(format!(
            "failed to create {}: {}",
            path.display(),
            err.error
        ))),
    }
}

/// Read and decode a JSON record. Missing files yield `Ok(None)`.
///
/// # Errors
///
/// Returns `AppError::Io` on read failure or `AppError::Serde` when the
/// content does not decode as `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(AppError::from(err)),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Remove a record file. Returns `false` when it was already gone.
///
/// # Errors
///
/// Returns `AppError::Store` on any failure other than "not found".
pub fn remove(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::Store(format!(
            "failed to remove {}: {err}",
            path.display()
        ))),
    }
}

/// Last modification time of a record file, if it can be read.
#[must_use]
pub fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn stage<T: Serialize>(path: &Path, value: &T) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Store("record path has no parent directory".into()))?;

    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Store(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(&bytes)
        .map_err(|err| AppError::Store(format!("failed to write temporary file: {err}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Store(format!("failed to sync temporary file: {err}")))?;
    Ok(tmp)
}
