use std::time::Duration;

use chrono::{TimeDelta, Utc};

use agent_sentinel::config::HeartbeatConfig;
use agent_sentinel::models::session::{Payload, SessionRecord};
use agent_sentinel::orchestrator::heartbeat::{is_stale_at, spawn_heartbeat_task, HeartbeatProtocol};
use agent_sentinel::persistence::db;
use agent_sentinel::persistence::session_repo::SessionRepo;
use tokio_util::sync::CancellationToken;

fn protocol(dir: &std::path::Path, interval: Duration) -> (SessionRepo, HeartbeatProtocol) {
    let state = db::connect(dir).expect("state dir");
    let repo = SessionRepo::new(&state, interval);
    let protocol = HeartbeatProtocol::new(repo.clone(), &HeartbeatConfig::default());
    (repo, protocol)
}

#[test]
fn refresh_missing_record_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, protocol) = protocol(dir.path(), Duration::from_secs(300));

    assert!(!protocol.refresh("4040"));
    assert!(repo.get("4040").expect("get").is_none());
}

#[test]
fn not_stale_immediately_after_refresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, protocol) = protocol(dir.path(), Duration::from_secs(1));

    let mut record = SessionRecord::new("12".into(), Payload::new(), Duration::from_secs(1));
    record.last_heartbeat = Some(Utc::now() - TimeDelta::seconds(60));
    repo.put(&record).expect("put");
    assert!(protocol.is_stale(&repo.get("12").expect("get").expect("exists")));

    assert!(protocol.refresh("12"));
    let refreshed = repo.get("12").expect("get").expect("exists");
    assert!(!protocol.is_stale(&refreshed));
}

#[test]
fn stale_once_silence_exceeds_interval_times_missed() {
    let now = Utc::now();
    let mut record = SessionRecord::new("9".into(), Payload::new(), Duration::from_secs(300));
    let legacy_ceiling = Duration::from_secs(86_400);

    record.last_heartbeat = Some(now - TimeDelta::seconds(899));
    assert!(!is_stale_at(&record, 3, legacy_ceiling, now));

    record.last_heartbeat = Some(now - TimeDelta::seconds(900));
    assert!(!is_stale_at(&record, 3, legacy_ceiling, now));

    record.last_heartbeat = Some(now - TimeDelta::seconds(901));
    assert!(is_stale_at(&record, 3, legacy_ceiling, now));

    // A looser tolerance keeps the same record fresh.
    assert!(!is_stale_at(&record, 4, legacy_ceiling, now));
}

#[test]
fn zero_interval_is_stale_after_any_silence() {
    let now = Utc::now();
    let mut record = SessionRecord::new("9".into(), Payload::new(), Duration::ZERO);
    record.last_heartbeat = Some(now - TimeDelta::milliseconds(5));
    assert!(is_stale_at(&record, 3, Duration::from_secs(60), now));
}

#[test]
fn pre_heartbeat_record_ages_against_ceiling() {
    let now = Utc::now();
    let mut record = SessionRecord::new("9".into(), Payload::new(), Duration::from_secs(300));
    record.last_heartbeat = None;
    record.heartbeat_interval_seconds = None;
    record.created_at = now - TimeDelta::hours(2);

    assert!(is_stale_at(&record, 3, Duration::from_secs(3600), now));
    assert!(!is_stale_at(&record, 3, Duration::from_secs(3 * 3600), now));
}

#[tokio::test]
async fn heartbeat_task_refreshes_until_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, protocol) = protocol(dir.path(), Duration::from_secs(1));

    let mut record = SessionRecord::new("321".into(), Payload::new(), Duration::from_secs(1));
    let old = Utc::now() - TimeDelta::seconds(30);
    record.last_heartbeat = Some(old);
    repo.put(&record).expect("put");

    let cancel = CancellationToken::new();
    let handle = spawn_heartbeat_task(
        protocol,
        "321".into(),
        Duration::from_millis(10),
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.expect("heartbeat task joins");

    let refreshed = repo.get("321").expect("get").expect("exists");
    assert!(refreshed.last_heartbeat.expect("heartbeat set") > old);
}

#[tokio::test(flavor = "current_thread")]
async fn heartbeat_task_runs_beside_blocking_payload_writers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, protocol) = protocol(dir.path(), Duration::from_secs(1));

    let mut record = SessionRecord::new("654".into(), Payload::new(), Duration::from_secs(1));
    let old = Utc::now() - TimeDelta::seconds(30);
    record.last_heartbeat = Some(old);
    repo.put(&record).expect("put");

    let writer_repo = repo.clone();
    let writer = std::thread::spawn(move || {
        for n in 0..50_u32 {
            let mut payload = Payload::new();
            payload.insert("step".into(), n.into());
            writer_repo.update_payload("654", payload).expect("update payload");
        }
    });

    let cancel = CancellationToken::new();
    let handle = spawn_heartbeat_task(
        protocol,
        "654".into(),
        Duration::from_millis(1),
        cancel.clone(),
    );

    // The single runtime thread keeps servicing timers while refreshes run.
    let started = std::time::Instant::now();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    writer.join().expect("writer thread");
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    handle.await.expect("heartbeat task joins");

    let after = repo.get("654").expect("get").expect("exists");
    assert!(after.last_heartbeat.expect("heartbeat set") > old);
    assert_eq!(after.payload.get("step"), Some(&serde_json::json!(49)));
}
