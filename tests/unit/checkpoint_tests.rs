use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;

use agent_sentinel::models::checkpoint::Checkpoint;
use agent_sentinel::orchestrator::checkpoint_manager::{CheckpointManager, NO_STAGE};
use agent_sentinel::persistence::checkpoint_repo::{task_key, CheckpointRepo};
use agent_sentinel::persistence::db;

fn manager(dir: &std::path::Path) -> (CheckpointRepo, CheckpointManager) {
    let state = db::connect(dir).expect("state dir");
    let repo = CheckpointRepo::new(&state);
    (repo.clone(), CheckpointManager::new(repo))
}

#[test]
fn save_load_clear_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());

    checkpoints
        .save("report-42", "stage_a", json!({"rows": 10}))
        .expect("save a");
    checkpoints
        .save("report-42", "stage_b", json!({"rows": 20}))
        .expect("save b");

    let loaded = checkpoints
        .load("report-42")
        .expect("load")
        .expect("checkpoint exists");
    assert_eq!(loaded.stage, "stage_b");
    assert_eq!(loaded.stage_data, json!({"rows": 20}));

    assert!(checkpoints.clear("report-42").expect("clear"));
    assert!(checkpoints.load("report-42").expect("load").is_none());
    assert!(!checkpoints.clear("report-42").expect("second clear"));
}

#[test]
fn one_checkpoint_per_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());

    for stage in ["fetch", "parse", "render"] {
        checkpoints.save("t1", stage, json!(null)).expect("save");
    }
    checkpoints.save("t2", "fetch", json!(null)).expect("save");

    let all = checkpoints.list().expect("list");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].task_id, "t1");
    assert_eq!(all[0].stage, "render");
    assert_eq!(all[1].task_id, "t2");
}

#[test]
fn persisted_layout_uses_data_field() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, checkpoints) = manager(dir.path());

    checkpoints
        .save("layout", "stage_x", json!({"k": "v"}))
        .expect("save");

    let raw = std::fs::read_to_string(repo.path_for("layout")).expect("read file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(value["stage"], json!("stage_x"));
    assert_eq!(value["data"], json!({"k": "v"}));
    assert_eq!(value["retry_count"], json!(0));
    assert!(value["timestamp"].is_string());
}

#[test]
fn retry_counter_survives_saves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());

    assert_eq!(checkpoints.increment_retry("job").expect("inc"), 1);
    let fresh = checkpoints.load("job").expect("load").expect("exists");
    assert_eq!(fresh.stage, NO_STAGE);

    checkpoints.save("job", "one", json!(1)).expect("save");
    assert_eq!(checkpoints.increment_retry("job").expect("inc"), 2);
    checkpoints.save("job", "two", json!(2)).expect("save");

    let loaded = checkpoints.load("job").expect("load").expect("exists");
    assert_eq!(loaded.stage, "two");
    assert_eq!(loaded.retry_count, 2);
}

#[test]
fn should_give_up_at_max_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());

    assert!(!checkpoints.should_give_up("job", 2).expect("check"));
    checkpoints.increment_retry("job").expect("inc");
    assert!(!checkpoints.should_give_up("job", 2).expect("check"));
    checkpoints.increment_retry("job").expect("inc");
    assert!(checkpoints.should_give_up("job", 2).expect("check"));
}

#[test]
fn cleanup_old_removes_only_expired() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, checkpoints) = manager(dir.path());

    let mut old = Checkpoint::new("old".into(), "stage".into(), json!(null), 0);
    old.timestamp = Utc::now() - TimeDelta::hours(48);
    repo.upsert(&old).expect("upsert old");
    checkpoints.save("recent", "stage", json!(null)).expect("save recent");

    let removed = checkpoints
        .cleanup_old(Duration::from_secs(24 * 3600))
        .expect("cleanup");
    assert_eq!(removed, vec!["old".to_owned()]);
    assert!(checkpoints.load("old").expect("load").is_none());
    assert!(checkpoints.load("recent").expect("load").is_some());
}

#[test]
fn task_ids_are_encoded_into_safe_keys() {
    assert_eq!(task_key("plain-id_1.2"), "plain-id_1.2");
    assert_eq!(task_key("a/b c"), "a%2Fb%20c");
    assert_eq!(task_key(".hidden"), "%2Ehidden");

    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());
    checkpoints
        .save("../../etc/passwd", "s", json!(null))
        .expect("save odd id");
    let loaded = checkpoints
        .load("../../etc/passwd")
        .expect("load")
        .expect("exists");
    assert_eq!(loaded.task_id, "../../etc/passwd");
    assert_eq!(
        std::fs::read_dir(dir.path().join("checkpoints"))
            .expect("read dir")
            .count(),
        1
    );
}

#[test]
fn corrupt_checkpoint_is_skipped_by_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, checkpoints) = manager(dir.path());

    checkpoints.save("good", "s", json!(null)).expect("save");
    std::fs::write(dir.path().join("checkpoints/checkpoint_bad.json"), "{").expect("write");

    let all = checkpoints.list().expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].task_id, "good");
}

#[test]
fn interrupted_write_leaves_last_good_stage() {
    use std::io::Write;

    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, checkpoints) = manager(dir.path());
    checkpoints
        .save("ingest", "stage_a", json!({"rows": 10}))
        .expect("save a");

    // A writer that died before its rename leaves only a partial temp file.
    let checkpoint_dir = repo.path_for("ingest").parent().expect("parent").to_path_buf();
    let mut partial = tempfile::NamedTempFile::new_in(&checkpoint_dir).expect("temp file");
    partial
        .write_all(br#"{"task_id": "ingest", "stage": "stage_b", "da"#)
        .expect("partial write");
    let (_file, stray) = partial.keep().expect("keep stray temp file");

    let loaded = checkpoints
        .load("ingest")
        .expect("load")
        .expect("checkpoint exists");
    assert_eq!(loaded.stage, "stage_a");
    assert_eq!(loaded.stage_data, json!({"rows": 10}));
    assert_eq!(checkpoints.list().expect("list").len(), 1);

    // The next save still lands cleanly beside the leftover.
    checkpoints
        .save("ingest", "stage_b", json!({"rows": 20}))
        .expect("save b");
    let loaded = checkpoints.load("ingest").expect("load").expect("exists");
    assert_eq!(loaded.stage, "stage_b");
    assert!(stray.exists());
}

#[test]
fn save_leaves_no_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (repo, checkpoints) = manager(dir.path());

    for stage in ["one", "two", "three"] {
        checkpoints.save("clean", stage, json!(null)).expect("save");
    }
    checkpoints.increment_retry("clean").expect("inc");

    let files: Vec<_> = std::fs::read_dir(dir.path().join("checkpoints"))
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(files, vec![repo.path_for("clean")]);
}
