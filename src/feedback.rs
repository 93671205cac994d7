//! Act-then-verify delegation for steps that declare an expected state.

use crate::actuator::ActionOutcome;
use crate::backoff::calculate_backoff_delay;
use crate::config::FeedbackConfig;
use crate::plan::{ExpectedState, PlanStep};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Handle back into the engine's single-step dispatcher.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch_step(&self, step: &PlanStep) -> ActionOutcome;
}

#[async_trait]
pub trait FeedbackLoop: Send + Sync {
    async fn execute_with_feedback(
        &self,
        step: &PlanStep,
        dispatcher: &dyn StepDispatcher,
    ) -> ActionOutcome;
}

/// Checks whether the host currently shows the expected state.
#[async_trait]
pub trait StateVerifier: Send + Sync {
    async fn verify(&self, step: &PlanStep, expected: &ExpectedState) -> Result<bool, String>;
}

/// Dispatches, verifies, and re-dispatches until the expected state holds
/// or the attempt budget runs out.
pub struct RetryingFeedbackLoop {
    verifier: Arc<dyn StateVerifier>,
    config: FeedbackConfig,
}

impl RetryingFeedbackLoop {
    pub fn new(verifier: Arc<dyn StateVerifier>, config: FeedbackConfig) -> Self {
        Self { verifier, config }
    }
}

#[async_trait]
impl FeedbackLoop for RetryingFeedbackLoop {
    async fn execute_with_feedback(
        &self,
        step: &PlanStep,
        dispatcher: &dyn StepDispatcher,
    ) -> ActionOutcome {
        let Some(expected) = &step.expected_state else {
            return dispatcher.dispatch_step(step).await;
        };

        let started = Instant::now();
        let attempts = self.config.max_attempts.max(1);
        let mut last = ActionOutcome::failed("feedback loop made no attempt");

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = calculate_backoff_delay(attempt - 1, &self.config.backoff);
                log::debug!(
                    "step {} retrying for expected state in {}ms",
                    step.id,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = dispatcher.dispatch_step(step).await;
            if !outcome.success {
                last = outcome;
                continue;
            }

            match self.verifier.verify(step, expected).await {
                Ok(true) => return outcome.with_duration(started.elapsed()),
                Ok(false) => {
                    let mut failed = ActionOutcome::failed(format!(
                        "expected state not reached after {} attempt(s): {}",
                        attempt + 1,
                        expected.description
                    ));
                    failed.output = outcome.output;
                    last = failed;
                }
                Err(err) => {
                    last = ActionOutcome::failed(format!("state verification failed: {}", err));
                }
            }
        }

        last.with_duration(started.elapsed())
    }
}
