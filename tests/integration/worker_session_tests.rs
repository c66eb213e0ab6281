//! Worker-side registration, heartbeating, and clean shutdown.

use std::path::Path;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;

use agent_sentinel::config::SupervisorConfig;
use agent_sentinel::models::session::{Payload, SessionRecord, SessionStatus};
use agent_sentinel::orchestrator::session_manager::WorkerSession;
use agent_sentinel::Supervisor;

fn open(dir: &Path, heartbeat_secs: u64) -> Supervisor {
    let mut config = SupervisorConfig {
        state_dir: Some(dir.to_path_buf()),
        ..SupervisorConfig::default()
    };
    config.heartbeat.interval_seconds = heartbeat_secs;
    Supervisor::open(config).expect("open supervisor")
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("object")
}

#[tokio::test]
async fn register_update_and_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = open(dir.path(), 300);

    let session = WorkerSession::register(&supervisor, payload(json!({"job": "nightly"})))
        .await
        .expect("register");
    let me = std::process::id().to_string();
    assert_eq!(session.worker_id(), me);

    let record = supervisor
        .sessions()
        .get(&me)
        .expect("get")
        .expect("record exists");
    assert_eq!(record.payload.get("job"), Some(&json!("nightly")));
    assert_eq!(record.heartbeat_interval_seconds, Some(300));

    let updated = session
        .update_payload(payload(json!({"job": "nightly", "stage": 2})))
        .expect("update payload");
    assert_eq!(updated.payload.get("stage"), Some(&json!(2)));
    let updated = session.set_status(SessionStatus::Idle).expect("set status");
    assert_eq!(updated.status, SessionStatus::Idle);
    assert!(session.beat());

    session.shutdown().await.expect("shutdown");
    assert!(supervisor.sessions().get(&me).expect("get").is_none());
}

#[tokio::test]
async fn registration_sweeps_abandoned_records_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = open(dir.path(), 300);

    let mut abandoned =
        SessionRecord::new("2147483647".into(), Payload::new(), Duration::from_secs(1));
    abandoned.last_heartbeat = Some(Utc::now() - TimeDelta::hours(1));
    supervisor.sessions().put(&abandoned).expect("plant");

    let session = WorkerSession::register(&supervisor, Payload::new())
        .await
        .expect("register");

    assert!(supervisor
        .sessions()
        .get("2147483647")
        .expect("get")
        .is_none());
    session.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn registration_without_sweep_leaves_others_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SupervisorConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..SupervisorConfig::default()
    };
    config.reaper.sweep_on_register = false;
    let supervisor = Supervisor::open(config).expect("open");

    let mut abandoned =
        SessionRecord::new("2147483647".into(), Payload::new(), Duration::from_secs(1));
    abandoned.last_heartbeat = Some(Utc::now() - TimeDelta::hours(1));
    supervisor.sessions().put(&abandoned).expect("plant");

    let session = WorkerSession::register(&supervisor, Payload::new())
        .await
        .expect("register");
    assert!(supervisor
        .sessions()
        .get("2147483647")
        .expect("get")
        .is_some());
    session.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn leftover_record_for_same_pid_is_replaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = open(dir.path(), 300);
    let me = std::process::id().to_string();

    let mut leftover = SessionRecord::new(
        me.clone(),
        payload(json!({"from": "previous process"})),
        Duration::from_secs(60),
    );
    leftover.created_at = Utc::now() - TimeDelta::days(3);
    supervisor.sessions().put(&leftover).expect("plant");

    let session = WorkerSession::register(&supervisor, payload(json!({"from": "this process"})))
        .await
        .expect("register");

    let record = supervisor
        .sessions()
        .get(&me)
        .expect("get")
        .expect("exists");
    assert_eq!(record.payload.get("from"), Some(&json!("this process")));
    assert!(record.created_at > leftover.created_at);
    session.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn dropping_the_handle_keeps_the_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = open(dir.path(), 300);

    let session = WorkerSession::register(&supervisor, Payload::new())
        .await
        .expect("register");
    let me = session.worker_id().to_owned();
    drop(session);

    assert!(supervisor.sessions().get(&me).expect("get").is_some());
}

#[tokio::test]
async fn background_task_keeps_heartbeat_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Zero interval: the task ticks as fast as it can.
    let supervisor = open(dir.path(), 0);

    let session = WorkerSession::register(&supervisor, Payload::new())
        .await
        .expect("register");
    let first = supervisor
        .sessions()
        .get(session.worker_id())
        .expect("get")
        .expect("exists")
        .last_heartbeat
        .expect("heartbeat");

    tokio::time::sleep(Duration::from_millis(30)).await;
    let later = supervisor
        .sessions()
        .get(session.worker_id())
        .expect("get")
        .expect("exists")
        .last_heartbeat
        .expect("heartbeat");

    assert!(later > first);
    session.shutdown().await.expect("shutdown");
}
