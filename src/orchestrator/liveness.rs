//! Process liveness oracle.
//!
//! Answers "does this pid exist?" with a zero-effect signal probe and,
//! optionally, "is it still the program we expect?" by inspecting its
//! command line. Ambiguous answers resolve to alive: reclaiming a live
//! worker costs far more than keeping a dead record one more sweep.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

/// Default bound on a single identity probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a command-line lookup stays cached for a pid.
pub const DEFAULT_IDENTITY_TTL: Duration = Duration::from_secs(5);

/// Tri-state result of an existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists (possibly owned by another user).
    Alive,
    /// No such process.
    Dead,
    /// The probe could not decide.
    Unknown,
}

impl Liveness {
    /// Fold to a boolean, treating `Unknown` as alive.
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// Probe whether `pid` exists by sending it the null signal.
#[cfg(unix)]
#[must_use]
pub fn probe(pid: i32) -> Liveness {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return Liveness::Dead;
    }
    classify_probe(kill(Pid::from_raw(pid), None))
}

/// Probe whether `pid` exists. Without a signal probe the answer is always
/// `Unknown` for positive pids.
#[cfg(not(unix))]
#[must_use]
pub fn probe(pid: i32) -> Liveness {
    if pid <= 0 {
        Liveness::Dead
    } else {
        Liveness::Unknown
    }
}

/// Map a `kill(pid, 0)` result to a [`Liveness`].
///
/// `EPERM` means the process exists but belongs to someone else: alive.
#[cfg(unix)]
#[must_use]
pub fn classify_probe(result: nix::Result<()>) -> Liveness {
    use nix::errno::Errno;

    match result {
        Ok(()) | Err(Errno::EPERM) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Unknown,
    }
}

/// Outcome of reading a process's command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityProbe {
    /// The command line (arguments joined by spaces).
    Command(String),
    /// The process is definitively gone.
    Gone,
    /// The probe failed or timed out.
    Failed(String),
}

struct CachedIdentity {
    command: String,
    fetched_at: Instant,
}

/// Liveness oracle owned by one supervisor instance.
///
/// Command-line lookups are cached per pid for a short TTL; the cache lives
/// and dies with the oracle.
pub struct LivenessOracle {
    probe_timeout: Duration,
    identity_ttl: Duration,
    identities: Mutex<HashMap<i32, CachedIdentity>>,
}

impl Default for LivenessOracle {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl LivenessOracle {
    /// Construct an oracle whose identity probes give up after `probe_timeout`.
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            identity_ttl: DEFAULT_IDENTITY_TTL,
            identities: Mutex::new(HashMap::new()),
        }
    }

    /// Override the identity cache TTL. `Duration::ZERO` disables caching.
    #[must_use]
    pub fn with_identity_ttl(mut self, ttl: Duration) -> Self {
        self.identity_ttl = ttl;
        self
    }

    /// Tri-state existence probe.
    #[must_use]
    pub fn liveness(&self, pid: i32) -> Liveness {
        let result = probe(pid);
        debug!(pid, ?result, "liveness probe");
        result
    }

    /// Whether `pid` currently exists. `pid <= 0` is never alive.
    #[must_use]
    pub fn is_alive(&self, pid: i32) -> bool {
        self.liveness(pid).is_alive()
    }

    /// Whether `pid` still runs a program matching `expected_signature`.
    ///
    /// The signature matches if it appears in the command line or equals the
    /// executable's base name. A failed or timed-out probe returns `true`.
    pub async fn verify_identity(&self, pid: i32, expected_signature: &str) -> bool {
        if pid <= 0 {
            return false;
        }
        match self.command_line(pid).await {
            IdentityProbe::Command(command) => {
                let matched = matches_signature(&command, expected_signature);
                debug!(pid, matched, %command, "identity probe");
                matched
            }
            IdentityProbe::Gone => false,
            IdentityProbe::Failed(reason) => {
                debug!(pid, %reason, "identity probe inconclusive, assuming expected worker");
                true
            }
        }
    }

    /// Drop all cached identity lookups.
    pub fn clear_cache(&self) {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn command_line(&self, pid: i32) -> IdentityProbe {
        if let Some(command) = self.cached(pid) {
            return IdentityProbe::Command(command);
        }

        let result = match tokio::time::timeout(self.probe_timeout, read_command_line(pid)).await
        {
            Ok(result) => result,
            Err(_) => IdentityProbe::Failed(format!(
                "timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        };

        if let IdentityProbe::Command(ref command) = result {
            if !self.identity_ttl.is_zero() {
                self.identities
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        pid,
                        CachedIdentity {
                            command: command.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
            }
        }
        result
    }

    fn cached(&self, pid: i32) -> Option<String> {
        let mut guard = self
            .identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let fresh = guard
            .get(&pid)
            .filter(|entry| entry.fetched_at.elapsed() < self.identity_ttl)
            .map(|entry| entry.command.clone());
        if fresh.is_none() {
            guard.remove(&pid);
        }
        fresh
    }
}

/// Whether `command` identifies the expected program.
#[must_use]
pub fn matches_signature(command: &str, expected_signature: &str) -> bool {
    let expected = expected_signature.trim();
    if expected.is_empty() {
        return true;
    }
    if command.contains(expected) {
        return true;
    }
    command
        .split_whitespace()
        .next()
        .and_then(|program| Path::new(program).file_name())
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == expected)
}

async fn read_command_line(pid: i32) -> IdentityProbe {
    #[cfg(target_os = "linux")]
    {
        match tokio::fs::read(format!("/proc/{pid}/cmdline")).await {
            Ok(raw) => {
                let command = raw
                    .split(|byte| *byte == 0)
                    .filter(|part| !part.is_empty())
                    .map(String::from_utf8_lossy)
                    .collect::<Vec<_>>()
                    .join(" ");
                if !command.is_empty() {
                    return IdentityProbe::Command(command);
                }
                // Kernel threads and zombies have an empty cmdline.
                if let Ok(comm) = tokio::fs::read_to_string(format!("/proc/{pid}/comm")).await {
                    let comm = comm.trim();
                    if !comm.is_empty() {
                        return IdentityProbe::Command(comm.to_owned());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return IdentityProbe::Gone;
            }
            Err(err) => {
                debug!(pid, %err, "procfs read failed, falling back to ps");
            }
        }
    }

    read_command_line_ps(pid).await
}

async fn read_command_line_ps(pid: i32) -> IdentityProbe {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) => {
            let command = String::from_utf8_lossy(&out.stdout).trim().to_owned();
            if !command.is_empty() {
                IdentityProbe::Command(command)
            } else if out.status.success() {
                IdentityProbe::Failed("ps returned an empty command".into())
            } else {
                IdentityProbe::Gone
            }
        }
        Err(err) => IdentityProbe::Failed(format!("failed to run ps: {err}")),
    }
}
