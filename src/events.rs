//! Named signals an engine emits to its own subscribers.

use crate::actuator::ActionOutcome;
use crate::engine::{PauseReason, PlanExecution, StepExecutionResult};
use crate::plan::PlanStep;
use serde::Serialize;
use tokio::sync::broadcast;

/// Execution lifecycle events
pub const EXECUTION_STARTED: &str = "execution:started";
pub const EXECUTION_PAUSED: &str = "execution:paused";
pub const EXECUTION_RESUMED: &str = "execution:resumed";
pub const EXECUTION_COMPLETED: &str = "execution:completed";
pub const EXECUTION_FAILED: &str = "execution:failed";
pub const EXECUTION_CANCELLED: &str = "execution:cancelled";

/// Step events
pub const STEP_STARTED: &str = "step:started";
pub const STEP_COMPLETED: &str = "step:completed";

/// Rollback events
pub const ROLLBACK_STARTED: &str = "rollback:started";
pub const ROLLBACK_STEP: &str = "rollback:step";
pub const ROLLBACK_STEP_COMPLETED: &str = "rollback:step-completed";
pub const ROLLBACK_STEP_FAILED: &str = "rollback:step-failed";
pub const ROLLBACK_COMPLETED: &str = "rollback:completed";

/// Out-of-band input
pub const INPUT_REQUIRED: &str = "input:required";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution: PlanExecution,
    },
    ExecutionPaused {
        execution: PlanExecution,
        reason: PauseReason,
    },
    ExecutionResumed {
        execution: PlanExecution,
    },
    ExecutionCompleted {
        execution: PlanExecution,
    },
    ExecutionFailed {
        execution: PlanExecution,
    },
    ExecutionCancelled {
        execution: PlanExecution,
    },
    #[serde(rename_all = "camelCase")]
    StepStarted {
        plan_id: String,
        step_index: usize,
        step: PlanStep,
    },
    #[serde(rename_all = "camelCase")]
    StepCompleted {
        plan_id: String,
        result: StepExecutionResult,
    },
    RollbackStarted {
        execution: PlanExecution,
    },
    #[serde(rename_all = "camelCase")]
    RollbackStep {
        plan_id: String,
        compensates: String,
        step: PlanStep,
    },
    #[serde(rename_all = "camelCase")]
    RollbackStepCompleted {
        plan_id: String,
        step: PlanStep,
        outcome: ActionOutcome,
    },
    #[serde(rename_all = "camelCase")]
    RollbackStepFailed {
        plan_id: String,
        step: PlanStep,
        outcome: ActionOutcome,
    },
    RollbackCompleted {
        execution: PlanExecution,
    },
    #[serde(rename_all = "camelCase")]
    InputRequired {
        plan_id: String,
        step: PlanStep,
        prompt: String,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => EXECUTION_STARTED,
            ExecutionEvent::ExecutionPaused { .. } => EXECUTION_PAUSED,
            ExecutionEvent::ExecutionResumed { .. } => EXECUTION_RESUMED,
            ExecutionEvent::ExecutionCompleted { .. } => EXECUTION_COMPLETED,
            ExecutionEvent::ExecutionFailed { .. } => EXECUTION_FAILED,
            ExecutionEvent::ExecutionCancelled { .. } => EXECUTION_CANCELLED,
            ExecutionEvent::StepStarted { .. } => STEP_STARTED,
            ExecutionEvent::StepCompleted { .. } => STEP_COMPLETED,
            ExecutionEvent::RollbackStarted { .. } => ROLLBACK_STARTED,
            ExecutionEvent::RollbackStep { .. } => ROLLBACK_STEP,
            ExecutionEvent::RollbackStepCompleted { .. } => ROLLBACK_STEP_COMPLETED,
            ExecutionEvent::RollbackStepFailed { .. } => ROLLBACK_STEP_FAILED,
            ExecutionEvent::RollbackCompleted { .. } => ROLLBACK_COMPLETED,
            ExecutionEvent::InputRequired { .. } => INPUT_REQUIRED,
        }
    }

    pub fn plan_id(&self) -> &str {
        match self {
            ExecutionEvent::ExecutionStarted { execution }
            | ExecutionEvent::ExecutionPaused { execution, .. }
            | ExecutionEvent::ExecutionResumed { execution }
            | ExecutionEvent::ExecutionCompleted { execution }
            | ExecutionEvent::ExecutionFailed { execution }
            | ExecutionEvent::ExecutionCancelled { execution }
            | ExecutionEvent::RollbackStarted { execution }
            | ExecutionEvent::RollbackCompleted { execution } => &execution.plan_id,
            ExecutionEvent::StepStarted { plan_id, .. }
            | ExecutionEvent::StepCompleted { plan_id, .. }
            | ExecutionEvent::RollbackStep { plan_id, .. }
            | ExecutionEvent::RollbackStepCompleted { plan_id, .. }
            | ExecutionEvent::RollbackStepFailed { plan_id, .. }
            | ExecutionEvent::InputRequired { plan_id, .. } => plan_id,
        }
    }
}

/// Per-engine signal channel. Slow subscribers lag rather than block the engine.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        log::debug!("{} [{}]", event.name(), event.plan_id());
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
