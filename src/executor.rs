//! Stage Executor: one uniform retry/timeout loop for every stage.
//!
//! ## Retry Strategy
//!
//! Each attempt runs under `tokio::time::timeout`. The result is classified:
//!
//! | Outcome                         | Action                                   |
//! |---------------------------------|------------------------------------------|
//! | success, payload validates      | record, return                           |
//! | recoverable `Validation`        | record, retry with guidance              |
//! | `Transient` / timeout           | record, back off, retry                  |
//! | `Resource`                      | retry at most `max_resource_retries`     |
//! | `Auth`, `FatalInput`, hard `Validation` | record, surface immediately      |
//!
//! Back-off doubles from `backoff_base` and is capped at `backoff_max`;
//! with 500 ms base and 3 attempts the waits are 500 ms then 1 s.
//!
//! The attempt budget can be shared between calls: [`StageCall::attempts_used`]
//! lets the orchestrator regenerate a scene after a render failure without
//! resetting the count.

use crate::config::{StagePolicies, StagePolicy};
use crate::error::StageError;
use crate::job::{AttemptOutcome, Stage, StageAttempt};
use crate::status::sanitize_message;
use chrono::Utc;
use std::future::Future;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};

/// What an attempt function is told about the try it is making.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based, counted across the whole budget of the slot.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Correction for this try, derived from the previous failure.
    pub guidance: Option<String>,
}

/// One invocation of the executor for a stage (or one scene of it).
#[derive(Debug, Clone)]
pub struct StageCall {
    pub stage: Stage,
    pub scene: Option<usize>,
    /// Guidance for the first attempt of this call.
    pub guidance: Option<String>,
    /// Attempts already spent on this slot by earlier calls.
    pub attempts_used: u32,
}

impl StageCall {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage,
            scene: None,
            guidance: None,
            attempts_used: 0,
        }
    }

    pub fn scene(stage: Stage, scene: usize) -> Self {
        Self {
            stage,
            scene: Some(scene),
            guidance: None,
            attempts_used: 0,
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }

    pub fn with_attempts_used(mut self, used: u32) -> Self {
        self.attempts_used = used;
        self
    }
}

/// Result of [`StageExecutor::run`].
#[derive(Debug)]
pub struct StageRun<T> {
    pub result: Result<T, StageError>,
    /// Attempts spent on the slot so far, including earlier calls.
    pub attempts_used: u32,
}

/// Runs stage functions under the configured per-stage policy.
#[derive(Debug, Clone, Default)]
pub struct StageExecutor {
    policies: StagePolicies,
}

impl StageExecutor {
    pub fn new(policies: StagePolicies) -> Self {
        Self { policies }
    }

    pub fn policy(&self, stage: Stage) -> &StagePolicy {
        self.policies.get(stage)
    }

    /// Run `attempt_fn` until it yields a payload accepted by `validate`, or
    /// the budget is spent, or a non-recoverable error surfaces.
    ///
    /// Every attempt is handed to `sink`, whatever its outcome.
    pub async fn run<T, F, Fut, V>(
        &self,
        call: StageCall,
        mut attempt_fn: F,
        validate: V,
        sink: &mut (dyn FnMut(StageAttempt) + Send),
    ) -> StageRun<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
        V: Fn(&T) -> Result<(), StageError>,
    {
        let policy = self.policies.get(call.stage).clone();
        let label = slot_label(call.stage, call.scene);
        let mut attempt = call.attempts_used;
        let mut guidance = call.guidance.clone();
        let mut resource_failures = 0u32;
        let mut last_err: Option<StageError> = None;

        while attempt < policy.max_attempts {
            attempt += 1;
            if last_err.is_some() {
                let wait = policy.backoff_before(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    label,
                    attempt,
                    policy.max_attempts,
                    wait.as_millis()
                );
                sleep(wait).await;
            }

            let ctx = AttemptContext {
                attempt,
                max_attempts: policy.max_attempts,
                guidance: guidance.clone(),
            };
            let started_at = Utc::now();
            let clock = Instant::now();

            let outcome = tokio::time::timeout(policy.attempt_timeout, attempt_fn(ctx)).await;
            let elapsed = clock.elapsed();

            let (err, kind) = match outcome {
                Ok(Ok(value)) => match validate(&value) {
                    Ok(()) => {
                        debug!("{}: attempt {} succeeded in {:?}", label, attempt, elapsed);
                        sink(StageAttempt {
                            stage: call.stage,
                            scene: call.scene,
                            attempt_number: attempt,
                            started_at,
                            ended_at: Utc::now(),
                            outcome: AttemptOutcome::Success,
                            detail: format!("completed in {}ms", elapsed.as_millis()),
                            error_kind: None,
                        });
                        return StageRun {
                            result: Ok(value),
                            attempts_used: attempt,
                        };
                    }
                    Err(e) => (e, AttemptOutcome::Failure),
                },
                Ok(Err(e)) => (e, AttemptOutcome::Failure),
                Err(_) => (
                    StageError::transient(format!(
                        "attempt timed out after {}s",
                        policy.attempt_timeout.as_secs_f32()
                    )),
                    AttemptOutcome::Timeout,
                ),
            };

            warn!("{}: attempt {} failed: {}", label, attempt, err);
            sink(StageAttempt {
                stage: call.stage,
                scene: call.scene,
                attempt_number: attempt,
                started_at,
                ended_at: Utc::now(),
                outcome: kind,
                detail: sanitize_message(&err.to_string()),
                error_kind: Some(err.kind()),
            });

            if !err.is_recoverable() {
                return StageRun {
                    result: Err(err),
                    attempts_used: attempt,
                };
            }
            if matches!(err, StageError::Resource { .. }) {
                resource_failures += 1;
                if resource_failures > policy.max_resource_retries {
                    return StageRun {
                        result: Err(err),
                        attempts_used: attempt,
                    };
                }
            }
            if let StageError::Validation { message, .. } = &err {
                guidance = Some(retry_guidance(message));
            }
            last_err = Some(err);
        }

        let err = last_err.unwrap_or_else(|| {
            StageError::validation(
                call.guidance
                    .unwrap_or_else(|| format!("{label}: retry budget exhausted")),
            )
        });
        StageRun {
            result: Err(err),
            attempts_used: attempt,
        }
    }
}

/// Instruction handed to the next attempt after a rejected output.
pub fn retry_guidance(problem: &str) -> String {
    format!("Your previous answer was rejected: {problem}. Correct this and answer again.")
}

fn slot_label(stage: Stage, scene: Option<usize>) -> String {
    match scene {
        Some(idx) => format!("{} scene {}", stage, idx + 1),
        None => stage.to_string(),
    }
}
