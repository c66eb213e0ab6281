use std::time::Duration;

use agent_sentinel::orchestrator::liveness::{probe, Liveness, LivenessOracle};

fn own_pid() -> i32 {
    i32::try_from(std::process::id()).expect("pid fits in i32")
}

#[test]
fn own_process_is_alive() {
    let oracle = LivenessOracle::default();
    assert!(oracle.is_alive(own_pid()));
}

#[cfg(unix)]
#[test]
fn unallocated_pid_is_dead() {
    let oracle = LivenessOracle::default();
    assert_eq!(oracle.liveness(i32::MAX), Liveness::Dead);
    assert!(!oracle.is_alive(i32::MAX));
}

#[test]
fn non_positive_pids_are_never_alive() {
    let oracle = LivenessOracle::default();
    assert!(!oracle.is_alive(0));
    assert!(!oracle.is_alive(-42));
    assert_eq!(probe(0), Liveness::Dead);
}

#[cfg(target_os = "linux")]
#[test]
fn pid_one_is_alive_even_without_permission() {
    // Unprivileged callers get EPERM for init; it still counts as alive.
    let oracle = LivenessOracle::default();
    assert!(oracle.is_alive(1));
}

#[cfg(unix)]
#[test]
fn permission_denied_maps_to_alive() {
    use agent_sentinel::orchestrator::liveness::classify_probe;
    use nix::errno::Errno;

    assert_eq!(classify_probe(Err(Errno::EPERM)), Liveness::Alive);
    assert!(classify_probe(Err(Errno::EPERM)).is_alive());
}

#[cfg(unix)]
#[tokio::test]
async fn identity_matches_own_test_binary() {
    let oracle = LivenessOracle::new(Duration::from_secs(2));
    let exe = std::env::current_exe().expect("current exe");
    let name = exe
        .file_name()
        .and_then(|n| n.to_str())
        .expect("exe name")
        .to_owned();

    assert!(oracle.verify_identity(own_pid(), &name).await);
    assert!(
        !oracle
            .verify_identity(own_pid(), "definitely-not-this-program-7f3a")
            .await
    );
}

#[tokio::test]
async fn identity_of_dead_pid_is_false() {
    let oracle = LivenessOracle::new(Duration::from_secs(2));
    assert!(!oracle.verify_identity(0, "anything").await);
    assert!(!oracle.verify_identity(i32::MAX, "anything").await);
}

#[cfg(unix)]
#[tokio::test]
async fn identity_cache_is_per_oracle_and_clearable() {
    let oracle =
        LivenessOracle::new(Duration::from_secs(2)).with_identity_ttl(Duration::from_secs(60));
    let exe = std::env::current_exe().expect("current exe");
    let name = exe.file_name().and_then(|n| n.to_str()).expect("exe name").to_owned();

    assert!(oracle.verify_identity(own_pid(), &name).await);
    // Served from cache on the second call.
    assert!(oracle.verify_identity(own_pid(), &name).await);
    oracle.clear_cache();
    assert!(oracle.verify_identity(own_pid(), &name).await);
}
