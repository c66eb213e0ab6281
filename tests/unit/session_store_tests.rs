use std::time::Duration;

use serde_json::json;

use agent_sentinel::models::session::{Payload, SessionRecord, SessionStatus};
use agent_sentinel::persistence::db;
use agent_sentinel::persistence::session_repo::{CreateOutcome, EntryKind, SessionRepo};
use agent_sentinel::AppError;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

fn open_repo(dir: &std::path::Path) -> SessionRepo {
    let state = db::connect(dir).expect("state dir");
    SessionRepo::new(&state, Duration::from_secs(300))
}

#[test]
fn create_writes_fresh_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let outcome = repo
        .create("4242", payload(json!({"task": "ingest"})))
        .expect("create");
    assert!(outcome.created());

    let record = repo.get("4242").expect("get").expect("record exists");
    assert_eq!(record.worker_id, "4242");
    assert_eq!(record.pid(), Some(4242));
    assert_eq!(record.heartbeat_interval_seconds, Some(300));
    assert!(record.last_heartbeat.is_some());
    assert_eq!(record.status, SessionStatus::Active);
    assert_eq!(record.payload.get("task"), Some(&json!("ingest")));
    assert!(repo.path_for("4242").ends_with("sessions/session_4242.json"));
}

#[test]
fn create_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    repo.create("77", payload(json!({"v": 1}))).expect("first create");
    let second = repo
        .create("77", payload(json!({"v": 2})))
        .expect("second create is not an error");

    assert!(matches!(second, CreateOutcome::AlreadyExists(_)));
    assert_eq!(second.record().payload.get("v"), Some(&json!(1)));
}

#[test]
fn create_rejects_non_pid_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let err = repo
        .create("worker-a", Payload::new())
        .expect_err("legacy ids are read-only");
    assert!(matches!(err, AppError::InvalidRecord(_)));

    let err = repo
        .create("../escape", Payload::new())
        .expect_err("path traversal");
    assert!(matches!(err, AppError::InvalidRecord(_)));
}

#[test]
fn get_missing_returns_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    assert!(repo.get("999").expect("get").is_none());
}

#[test]
fn delete_reports_whether_record_existed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    repo.create("31", Payload::new()).expect("create");

    assert!(repo.delete("31").expect("delete"));
    assert!(!repo.delete("31").expect("second delete"));
    assert!(repo.get("31").expect("get").is_none());
}

#[test]
fn update_heartbeat_on_missing_record_is_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    let updated = repo
        .update_heartbeat("123", chrono::Utc::now())
        .expect("no error for missing record");
    assert!(updated.is_none());
}

#[test]
fn update_heartbeat_backfills_interval() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut record = SessionRecord::new("55".into(), Payload::new(), Duration::from_secs(300));
    record.last_heartbeat = None;
    record.heartbeat_interval_seconds = None;
    repo.put(&record).expect("put");
    assert!(repo.get("55").expect("get").expect("exists").is_pre_heartbeat());

    let at = chrono::Utc::now();
    let updated = repo
        .update_heartbeat("55", at)
        .expect("update")
        .expect("record exists");
    assert_eq!(updated.last_heartbeat, Some(at));
    assert_eq!(updated.heartbeat_interval_seconds, Some(300));
    assert!(!updated.is_pre_heartbeat());
}

#[test]
fn payload_and_status_updates_require_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let err = repo
        .update_payload("8", Payload::new())
        .expect_err("missing record");
    assert!(matches!(err, AppError::NotFound(_)));

    repo.create("8", Payload::new()).expect("create");
    let record = repo
        .update_payload("8", payload(json!({"step": 3})))
        .expect("update payload");
    assert_eq!(record.payload.get("step"), Some(&json!(3)));

    let record = repo.set_status("8", SessionStatus::Idle).expect("set status");
    assert_eq!(record.status, SessionStatus::Idle);
    assert_eq!(
        repo.get("8").expect("get").expect("exists").status,
        SessionStatus::Idle
    );
}

#[test]
fn list_classifies_current_legacy_and_unreadable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    let sessions = dir.path().join("sessions");

    repo.create("100", Payload::new()).expect("create");
    std::fs::write(
        sessions.join("session_worker-alpha.json"),
        r#"{"payload": {"task": "old"}}"#,
    )
    .expect("write legacy");
    std::fs::write(sessions.join("session_200.json"), "{not json").expect("write corrupt");
    std::fs::write(sessions.join("notes.txt"), "ignored").expect("write stray file");

    let entries = repo.list().expect("list");
    let ids: Vec<&str> = entries.iter().map(|e| e.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["100", "200", "worker-alpha"]);

    assert!(matches!(entries[0].kind, EntryKind::Current(_)));
    assert!(matches!(entries[1].kind, EntryKind::Unreadable { .. }));
    match &entries[2].kind {
        EntryKind::Legacy { payload } => {
            assert_eq!(payload.as_ref(), Some(&json!({"task": "old"})));
        }
        other => panic!("expected legacy entry, got {other:?}"),
    }
    assert!(entries.iter().all(|e| e.modified_at.is_some()));
}

#[test]
fn zero_pid_is_legacy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    std::fs::write(dir.path().join("sessions/session_0.json"), "{}").expect("write");

    let entries = repo.list().expect("list");
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].kind, EntryKind::Legacy { .. }));
}

#[test]
fn remove_entry_deletes_legacy_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    let legacy = dir.path().join("sessions/session_a b.json");
    std::fs::write(&legacy, "garbage").expect("write legacy");

    let entries = repo.list().expect("list");
    assert_eq!(entries.len(), 1);
    assert!(repo.remove_entry(&entries[0]).expect("remove"));
    assert!(!legacy.exists());
}

#[test]
fn put_leaves_no_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let record = SessionRecord::new("64".into(), Payload::new(), Duration::from_secs(10));
    for _ in 0..5 {
        repo.put(&record).expect("put");
    }

    let files: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(files, vec![std::ffi::OsString::from("session_64.json")]);
}
