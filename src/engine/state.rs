use crate::actuator::ActionOutcome;
use crate::errors::AppError;
use crate::plan::{ExecutionPlan, PlanStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    RollingBack,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    Requested,
    #[serde(rename_all = "camelCase")]
    ConfirmationRequired { step_index: usize, step_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_index: usize,
    pub step: PlanStep,
    pub outcome: ActionOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Mutable record of one run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub plan_id: String,
    pub plan: Arc<ExecutionPlan>,
    pub status: ExecutionStatus,
    pub current_step_index: usize,
    /// Forward results in dispatch order. Append-only.
    pub step_results: Vec<StepExecutionResult>,
    /// Compensating steps in the order they ran.
    #[serde(default)]
    pub rollback_results: Vec<StepExecutionResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    /// Set when at least one compensating step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<AppError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
}

impl PlanExecution {
    pub fn new(plan: Arc<ExecutionPlan>) -> Self {
        Self {
            plan_id: plan.id.clone(),
            plan,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            step_results: Vec::new(),
            rollback_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            rollback_error: None,
            pause_reason: None,
        }
    }

    /// A failed record that was never registered or run.
    pub fn rejected(plan: Arc<ExecutionPlan>, error: AppError) -> Self {
        let mut execution = Self::new(plan);
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.error = Some(error);
        execution
    }

    /// The step that failed the run, if any.
    pub fn failed_step(&self) -> Option<&StepExecutionResult> {
        self.step_results.iter().rev().find(|r| !r.outcome.success)
    }

    pub fn rollback_ran(&self) -> bool {
        !self.rollback_results.is_empty()
    }
}
