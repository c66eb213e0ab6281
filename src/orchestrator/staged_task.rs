//! Resumable multi-stage task runner.
//!
//! Glues the checkpoint manager to the recovery engine: stages already
//! recorded in a checkpoint are skipped, each stage runs under the engine's
//! retry policy, and a checkpoint is saved after every completed stage.

use std::fmt::Display;
use std::future::Future;

use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use crate::models::recovery::ErrorContext;
use crate::Result;

use super::checkpoint_manager::{CheckpointManager, NO_STAGE};
use super::recovery::RecoveryEngine;

/// How a staged run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOutcome {
    /// Every stage completed; the checkpoint was cleared.
    Completed {
        /// Output of the final stage.
        output: Value,
        /// Stages skipped because a checkpoint covered them.
        resumed_from: Option<String>,
    },
    /// A stage failed terminally; the checkpoint keeps the last good stage.
    Failed {
        /// Stage that failed.
        stage: String,
        /// Failure details from the recovery engine.
        error: ErrorContext,
        /// Task-level retry counter after this failure.
        retry_count: u32,
    },
    /// The task already used up its restarts; nothing ran.
    GaveUp {
        /// Task-level retry counter.
        retry_count: u32,
    },
}

/// Run `stages` of `task_id` in order, resuming after the last checkpoint.
///
/// `run_stage` receives the stage name and the previous stage's output (the
/// checkpointed data when resuming, `Value::Null` on a fresh start) and
/// returns the data to checkpoint for that stage.
///
/// # Errors
///
/// Returns `AppError` only when checkpoint persistence fails; stage failures
/// are reported through [`StagedOutcome::Failed`].
pub async fn run_staged_task<F, Fut, E>(
    checkpoints: &CheckpointManager,
    engine: &mut RecoveryEngine,
    task_id: &str,
    stages: &[&str],
    max_retries: u32,
    mut run_stage: F,
) -> Result<StagedOutcome>
where
    F: FnMut(String, Value) -> Fut,
    Fut: Future<Output = std::result::Result<Value, E>>,
    E: Display,
{
    let span = info_span!("staged_task", task_id);
    async move {
        if checkpoints.should_give_up(task_id, max_retries)? {
            let retry_count = checkpoints
                .load(task_id)?
                .map_or(0, |checkpoint| checkpoint.retry_count);
            warn!(retry_count, max_retries, "task exhausted its restarts");
            return Ok(StagedOutcome::GaveUp { retry_count });
        }

        let (start, mut data, resumed_from) = match checkpoints.load(task_id)? {
            Some(checkpoint) if checkpoint.stage != NO_STAGE => {
                match stages.iter().position(|stage| *stage == checkpoint.stage) {
                    Some(index) => {
                        info!(stage = %checkpoint.stage, "resuming after checkpoint");
                        (index + 1, checkpoint.stage_data, Some(checkpoint.stage))
                    }
                    None => {
                        warn!(
                            stage = %checkpoint.stage,
                            "checkpoint names an unknown stage, starting over"
                        );
                        (0, Value::Null, None)
                    }
                }
            }
            _ => (0, Value::Null, None),
        };

        for stage in &stages[start..] {
            let unit_id = format!("{task_id}:{stage}");
            let outcome = engine
                .execute(&unit_id, || run_stage((*stage).to_owned(), data.clone()))
                .await;

            match outcome.into_result() {
                Ok(output) => {
                    checkpoints.save(task_id, stage, output.clone())?;
                    data = output;
                }
                Err(error) => {
                    let retry_count = checkpoints.increment_retry(task_id)?;
                    warn!(%stage, retry_count, error = %error, "stage failed");
                    return Ok(StagedOutcome::Failed {
                        stage: (*stage).to_owned(),
                        error,
                        retry_count,
                    });
                }
            }
        }

        checkpoints.clear(task_id)?;
        info!("task completed");
        Ok(StagedOutcome::Completed {
            output: data,
            resumed_from,
        })
    }
    .instrument(span)
    .await
}
