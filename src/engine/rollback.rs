use super::{
    DispatchPhase, ExecutionStatus, PlanExecutionEngine, RunControl, StepExecutionResult,
};
use crate::actuator::ActionOutcome;
use crate::errors::{AppError, EngineError};
use crate::events::ExecutionEvent;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

impl PlanExecutionEngine {
    /// Compensates every successful, reversible step of a failed run,
    /// most recent first. A failed compensation does not stop the sweep; the
    /// failures are summarised in `rollback_error`.
    pub(super) async fn rollback(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
    ) -> Result<(), EngineError> {
        let (targets, execution) = self
            .with_execution(plan_id, control, |execution| {
                execution.status = ExecutionStatus::RollingBack;
                let targets: Vec<_> = execution
                    .step_results
                    .iter()
                    .filter(|result| result.outcome.success && result.step.is_compensable())
                    .filter_map(|result| {
                        result.step.rollback.as_deref().map(|compensation| {
                            (result.step_index, result.step.id.clone(), compensation.clone())
                        })
                    })
                    .collect();
                (targets, execution.clone())
            })
            .await?;

        log::info!(
            "rolling back plan {}: {} step(s) to compensate",
            plan_id,
            targets.len()
        );
        self.events
            .emit(ExecutionEvent::RollbackStarted { execution });

        let total = targets.len();
        let mut failed_ids = Vec::new();
        // Compensations always run to completion.
        let uncancelled = CancellationToken::new();
        for (step_index, original_id, compensation) in targets.into_iter().rev() {
            self.events.emit(ExecutionEvent::RollbackStep {
                plan_id: plan_id.to_string(),
                compensates: original_id.clone(),
                step: compensation.clone(),
            });

            let started_at = Utc::now();
            let outcome = match self
                .dispatcher
                .dispatch(plan_id, &compensation, DispatchPhase::Rollback, &uncancelled)
                .await
            {
                Ok(dispatched) => {
                    if dispatched.denied {
                        log::error!(
                            "rollback of step {} in plan {} was blocked by the permission gate; its effect remains applied",
                            original_id,
                            plan_id
                        );
                    }
                    dispatched.outcome
                }
                Err(err) => ActionOutcome::failed(err.to_string()),
            };

            if outcome.success {
                self.events.emit(ExecutionEvent::RollbackStepCompleted {
                    plan_id: plan_id.to_string(),
                    step: compensation.clone(),
                    outcome: outcome.clone(),
                });
            } else {
                log::error!(
                    "compensating step {} for {} failed: {}",
                    compensation.id,
                    original_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                failed_ids.push(compensation.id.clone());
                self.events.emit(ExecutionEvent::RollbackStepFailed {
                    plan_id: plan_id.to_string(),
                    step: compensation.clone(),
                    outcome: outcome.clone(),
                });
            }

            let result = StepExecutionResult {
                step_index,
                step: compensation,
                outcome,
                started_at,
                completed_at: Utc::now(),
            };
            self.with_execution(plan_id, control, |execution| {
                execution.rollback_results.push(result)
            })
            .await?;
        }

        let rollback_error = (!failed_ids.is_empty()).then(|| {
            AppError::rollback(
                format!(
                    "{} of {} compensating step(s) failed",
                    failed_ids.len(),
                    total
                ),
                Some(failed_ids.join(", ")),
            )
        });
        let execution = self
            .with_execution(plan_id, control, |execution| {
                execution.status = ExecutionStatus::Failed;
                execution.rollback_error = rollback_error;
                execution.clone()
            })
            .await?;
        log::info!(
            "rollback of plan {} finished ({} compensating step(s))",
            plan_id,
            execution.rollback_results.len()
        );
        self.events
            .emit(ExecutionEvent::RollbackCompleted { execution });
        Ok(())
    }
}
