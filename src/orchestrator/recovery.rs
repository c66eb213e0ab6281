//! Retry/recovery engine.
//!
//! Wraps a unit of work, classifies each failure by severity, and decides
//! between retrying after a backoff and stopping. Every attempt lands in an
//! append-only audit trail owned by the engine instance. Work failures never
//! escape as errors: callers always get a [`RecoveryOutcome`].

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::models::recovery::{
    AttemptOutcome, BackoffKind, ErrorContext, ErrorSeverity, RecoveryAttempt, RecoveryStrategy,
};

/// Jitter spread applied to each delay, as a fraction of the delay.
const JITTER_SPREAD: f64 = 0.25;

/// Keyword rules, checked in order; the first match wins.
///
/// Transport markers (timeouts, resets, rate limits, 502/503/504) outrank
/// the content rules, so "timeout fetching schema" stays retryable. Only
/// resource exhaustion and permission failures outrank them.
static SEVERITY_RULES: LazyLock<Vec<(ErrorSeverity, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorSeverity::Fatal,
            r"(?i)out of memory|\boom\b|no space left|disk full|resource exhausted|too many open files|permission denied|access denied|operation not permitted|\bforbidden\b|\b403\b",
        ),
        (
            ErrorSeverity::Transient,
            r"(?i)timeout|timed out|time out|connection (reset|refused|aborted|closed)|broken pipe|rate.?limit|too many requests|temporarily unavailable|service unavailable|bad gateway|\b429\b|\b50[234]\b",
        ),
        (
            ErrorSeverity::Validation,
            r"(?i)validation|invalid|malformed|schema|missing field|parse error|failed to parse|unexpected token|bad request|\b400\b|\b422\b",
        ),
        (
            ErrorSeverity::Dependency,
            r"(?i)missing required|required input|dependency|no such file|not found|\b404\b",
        ),
    ]
    .into_iter()
    .filter_map(|(severity, pattern)| Regex::new(pattern).ok().map(|re| (severity, re)))
    .collect()
});

/// Classify a failure message. Unrecognized failures are `Transient`.
#[must_use]
pub fn classify_error(message: &str) -> ErrorSeverity {
    SEVERITY_RULES
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map_or(ErrorSeverity::Transient, |(severity, _)| *severity)
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Growth shape.
    pub kind: BackoffKind,
    /// Base delay.
    pub base: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Spread each delay by up to ±25%.
    pub jitter: bool,
}

impl Backoff {
    /// Deterministic delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.kind {
            BackoffKind::None => return Duration::ZERO,
            BackoffKind::Fixed => self.base,
            BackoffKind::Linear => self.base.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                self.scaled(self.multiplier.powi(exponent))
            }
        };
        raw.min(self.max_delay)
    }

    /// Delay for `attempt` with jitter applied when enabled.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_SPREAD)..=(1.0 + JITTER_SPREAD));
        let jittered = delay.as_secs_f64() * factor;
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    fn scaled(&self, factor: f64) -> Duration {
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Retry eligibility rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay schedule.
    pub backoff: Backoff,
    /// Whether `Dependency` failures may be retried.
    pub retry_dependency: bool,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Backoff {
                kind: config.backoff,
                base: Duration::from_millis(config.base_delay_ms),
                multiplier: config.multiplier,
                max_delay: Duration::from_millis(config.max_delay_ms),
                jitter: config.jitter,
            },
            retry_dependency: config.retry_dependency,
        }
    }

    /// Whether a unit that just failed attempt `attempt` with `severity`
    /// gets another attempt.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, severity: ErrorSeverity) -> bool {
        let eligible = match severity {
            ErrorSeverity::Validation | ErrorSeverity::Fatal => false,
            ErrorSeverity::Dependency => self.retry_dependency,
            ErrorSeverity::Transient => true,
        };
        eligible && attempt < self.max_attempts
    }
}

/// Uniform result of [`RecoveryEngine::execute_with_recovery`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome<T> {
    /// Whether the unit eventually succeeded.
    pub success: bool,
    /// Value returned by the successful attempt.
    pub result: Option<T>,
    /// Terminal failure details.
    pub error: Option<ErrorContext>,
    /// Strategy in force when the unit finished.
    pub strategy: RecoveryStrategy,
}

impl<T> RecoveryOutcome<T> {
    /// Whether the caller should move on to the next independent unit.
    #[must_use]
    pub fn should_proceed(&self) -> bool {
        self.success || self.strategy.proceeds_after_failure()
    }

    /// Convert into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorContext`] when the unit failed.
    pub fn into_result(self) -> std::result::Result<T, ErrorContext> {
        match (self.result, self.error) {
            (Some(value), _) if self.success => Ok(value),
            (_, Some(context)) => Err(context),
            (_, None) => Err(ErrorContext {
                unit_id: String::new(),
                last_error: "unit produced no result".into(),
                severity: ErrorSeverity::Fatal,
                attempts: 0,
                rollback_error: None,
            }),
        }
    }
}

type RollbackFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Best-effort compensation run once after a terminal failure.
pub type Rollback = Box<dyn FnOnce(ErrorContext) -> RollbackFuture + Send>;

/// Box an async closure as a [`Rollback`].
#[must_use]
pub fn rollback<F, Fut, E>(f: F) -> Rollback
where
    F: FnOnce(ErrorContext) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Display,
{
    Box::new(move |context| {
        let fut = f(context);
        Box::pin(async move { fut.await.map_err(|err| err.to_string()) })
    })
}

/// Aggregate view of the audit trail.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Distinct units executed.
    pub units: usize,
    /// Total attempts recorded.
    pub attempts: usize,
    /// Successful attempts.
    pub successes: usize,
    /// Failed attempts.
    pub failures: usize,
    /// Failed attempts per severity.
    pub by_severity: HashMap<ErrorSeverity, usize>,
}

/// Retry/recovery engine. One instance per worker; its audit trail is not shared.
pub struct RecoveryEngine {
    engine_id: String,
    policy: RetryPolicy,
    strategy: RecoveryStrategy,
    classifier: fn(&str) -> ErrorSeverity,
    attempts: Vec<RecoveryAttempt>,
}

impl RecoveryEngine {
    /// Construct an engine with the default message classifier.
    #[must_use]
    pub fn new(policy: RetryPolicy, strategy: RecoveryStrategy) -> Self {
        Self {
            engine_id: Uuid::new_v4().to_string(),
            policy,
            strategy,
            classifier: classify_error,
            attempts: Vec::new(),
        }
    }

    /// Construct an engine from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(RetryPolicy::from_config(config), config.strategy)
    }

    /// Replace the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: fn(&str) -> ErrorSeverity) -> Self {
        self.classifier = classifier;
        self
    }

    /// Identifier of this engine instance, used in log spans.
    #[must_use]
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Retry policy in force.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Top-level strategy in force.
    #[must_use]
    pub fn strategy(&self) -> RecoveryStrategy {
        self.strategy
    }

    /// Whether a failure of `severity` on `attempt` would be retried,
    /// taking the strategy into account.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, severity: ErrorSeverity) -> bool {
        self.strategy != RecoveryStrategy::FailFast && self.policy.should_retry(attempt, severity)
    }

    /// Full audit trail in execution order.
    #[must_use]
    pub fn attempts(&self) -> &[RecoveryAttempt] {
        &self.attempts
    }

    /// Audit trail entries for one unit.
    pub fn attempts_for<'a>(
        &'a self,
        unit_id: &'a str,
    ) -> impl Iterator<Item = &'a RecoveryAttempt> {
        self.attempts.iter().filter(move |a| a.unit_id == unit_id)
    }

    /// Aggregate counts over the audit trail.
    #[must_use]
    pub fn summary(&self) -> RecoverySummary {
        let mut summary = RecoverySummary {
            attempts: self.attempts.len(),
            ..RecoverySummary::default()
        };
        let mut units: Vec<&str> = Vec::new();
        for attempt in &self.attempts {
            if !units.contains(&attempt.unit_id.as_str()) {
                units.push(&attempt.unit_id);
            }
            if attempt.succeeded() {
                summary.successes += 1;
            } else {
                summary.failures += 1;
            }
            if let Some(severity) = attempt.classified_severity {
                *summary.by_severity.entry(severity).or_default() += 1;
            }
        }
        summary.units = units.len();
        summary
    }

    /// Run `work` without a rollback.
    pub async fn execute<T, E, F, Fut>(&mut self, unit_id: &str, work: F) -> RecoveryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.execute_with_recovery(unit_id, work, None).await
    }

    /// Run `work` until it succeeds or a failure is terminal.
    ///
    /// Backoff sleeps block this unit, not the runtime. On terminal failure
    /// `rollback` runs once; its own failure is recorded on the
    /// [`ErrorContext`] without replacing the original error.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &mut self,
        unit_id: &str,
        mut work: F,
        rollback: Option<Rollback>,
    ) -> RecoveryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let span = info_span!("execute_with_recovery", unit_id, engine_id = %self.engine_id);

        async move {
            let mut attempt: u32 = 0;
            let mut delay = Duration::ZERO;

            loop {
                attempt += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let failure = match work().await {
                    Ok(value) => {
                        self.record(unit_id, attempt, AttemptOutcome::Succeeded, None, delay);
                        info!(attempt, "unit succeeded");
                        return RecoveryOutcome {
                            success: true,
                            result: Some(value),
                            error: None,
                            strategy: self.strategy,
                        };
                    }
                    Err(err) => err.to_string(),
                };

                let severity = (self.classifier)(&failure);
                self.record(
                    unit_id,
                    attempt,
                    AttemptOutcome::Failed {
                        error: failure.clone(),
                    },
                    Some(severity),
                    delay,
                );

                if self.should_retry(attempt, severity) {
                    delay = self.policy.backoff.delay_with_jitter(attempt);
                    warn!(
                        attempt,
                        %severity,
                        delay_ms = duration_ms(delay),
                        error = %failure,
                        "attempt failed, retrying"
                    );
                    continue;
                }

                let mut context = ErrorContext {
                    unit_id: unit_id.to_owned(),
                    last_error: failure,
                    severity,
                    attempts: attempt,
                    rollback_error: None,
                };
                warn!(
                    attempt,
                    %severity,
                    error = %context.last_error,
                    strategy = ?self.strategy,
                    "unit failed terminally"
                );

                if let Some(rollback) = rollback {
                    match rollback(context.clone()).await {
                        Ok(()) => info!("rollback completed"),
                        Err(err) => {
                            warn!(%err, "rollback failed");
                            context.rollback_error = Some(err);
                        }
                    }
                }

                return RecoveryOutcome {
                    success: false,
                    result: None,
                    error: Some(context),
                    strategy: self.strategy,
                };
            }
        }
        .instrument(span)
        .await
    }

    fn record(
        &mut self,
        unit_id: &str,
        attempt_number: u32,
        outcome: AttemptOutcome,
        classified_severity: Option<ErrorSeverity>,
        delay: Duration,
    ) {
        self.attempts.push(RecoveryAttempt {
            unit_id: unit_id.to_owned(),
            attempt_number,
            outcome,
            classified_severity,
            delay_before_attempt_ms: duration_ms(delay),
            timestamp: Utc::now(),
        });
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
