//! Recovery engine vocabulary: severities, policies, and the attempt audit trail.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a work-unit failure; drives retry eligibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Timeouts, resets, rate limits, gateway errors. Retry-eligible.
    Transient,
    /// Malformed input or schema violations. Never retried.
    Validation,
    /// Missing required input. Retried only when the policy allows it.
    Dependency,
    /// Resource exhaustion or permission denial. Never retried.
    Fatal,
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Dependency => "dependency",
            Self::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Retry immediately.
    None,
    /// Constant delay.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * multiplier^(attempt - 1)`, capped.
    Exponential,
}

/// Top-level behavior after a unit fails terminally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Stop at the first failure; no retries.
    FailFast,
    /// Report the failure and let the caller move to the next unit.
    ContinueOnError,
    /// Retry per policy, then stop.
    RetryThenFail,
    /// Retry per policy, then skip the unit and move on.
    RetryThenSkip,
}

impl RecoveryStrategy {
    /// Whether the caller should proceed to the next independent unit after
    /// this unit failed terminally.
    #[must_use]
    pub fn proceeds_after_failure(self) -> bool {
        matches!(self, Self::ContinueOnError | Self::RetryThenSkip)
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    /// The work function returned a value.
    Succeeded,
    /// The work function failed with the given message.
    Failed {
        /// Rendered error message.
        error: String,
    },
}

/// One entry of the append-only attempt audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryAttempt {
    /// Unit of work this attempt belongs to.
    pub unit_id: String,
    /// 1-based attempt number within the unit.
    pub attempt_number: u32,
    /// Attempt result.
    pub outcome: AttemptOutcome,
    /// Severity of the failure; `None` on success.
    pub classified_severity: Option<ErrorSeverity>,
    /// Backoff applied before this attempt started.
    pub delay_before_attempt_ms: u64,
    /// Time the attempt finished.
    pub timestamp: DateTime<Utc>,
}

impl RecoveryAttempt {
    /// Backoff applied before this attempt as a [`Duration`].
    #[must_use]
    pub fn delay_before_attempt(&self) -> Duration {
        Duration::from_millis(self.delay_before_attempt_ms)
    }

    /// Whether the attempt succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

/// Structured description of a terminal failure, fit for display or logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ErrorContext {
    /// Unit of work that failed.
    pub unit_id: String,
    /// Last error message observed.
    pub last_error: String,
    /// Severity of the last error.
    pub severity: ErrorSeverity,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Rollback failure, if a rollback ran and failed.
    pub rollback_error: Option<String>,
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unit {} failed after {} attempt(s) [{}]: {}",
            self.unit_id, self.attempts, self.severity, self.last_error
        )?;
        if let Some(ref rollback) = self.rollback_error {
            write!(f, " (rollback failed: {rollback})")?;
        }
        Ok(())
    }
}
