//! Plan execution engine: sequences steps through the permission gate,
//! honours pause/resume/cancel at step boundaries, and rolls back on failure.
//!
//! One engine owns its actuators, its run registry and its signal stream.
//! Every public operation returns data; failures are recorded on the
//! `PlanExecution` rather than raised.

mod dispatch;
mod rollback;
mod state;

pub use dispatch::{DispatchHandle, DispatchPhase, Dispatched, Dispatcher};
pub use state::{ExecutionStatus, PauseReason, PlanExecution, StepExecutionResult};

use crate::actuator::{ActionOutcome, Actuators};
use crate::audit::AuditLogger;
use crate::config::EngineConfig;
use crate::errors::{AppError, EngineError};
use crate::events::{EventEmitter, ExecutionEvent};
use crate::feedback::FeedbackLoop;
use crate::permission::PermissionGate;
use crate::plan::{ExecutionPlan, PlanStep, RiskLevel};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

const NO_STEP: usize = usize::MAX;

/// Flags shared between a running step loop and the control operations.
struct RunControl {
    pause_requested: AtomicBool,
    /// Index of the high-risk step the caller approved by resuming.
    confirmed_step: AtomicUsize,
    /// Step loops currently running for this plan.
    loops: AtomicUsize,
    /// Fired by `cancel`; interrupts waits inside the in-flight step.
    cancel: CancellationToken,
}

impl RunControl {
    fn new() -> Self {
        Self {
            pause_requested: AtomicBool::new(false),
            confirmed_step: AtomicUsize::new(NO_STEP),
            loops: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.loops.load(Ordering::SeqCst) > 0
    }
}

struct ActiveLoop(Arc<RunControl>);

impl ActiveLoop {
    fn enter(control: Arc<RunControl>) -> Self {
        control.loops.fetch_add(1, Ordering::SeqCst);
        Self(control)
    }
}

impl Drop for ActiveLoop {
    fn drop(&mut self) {
        self.0.loops.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RunEntry {
    execution: PlanExecution,
    control: Arc<RunControl>,
}

pub struct PlanExecutionEngine {
    config: EngineConfig,
    dispatcher: Dispatcher,
    feedback: Option<Arc<dyn FeedbackLoop>>,
    runs: RwLock<HashMap<String, RunEntry>>,
    events: EventEmitter,
    closed: AtomicBool,
}

impl PlanExecutionEngine {
    pub fn new(
        config: EngineConfig,
        actuators: Actuators,
        gate: Arc<dyn PermissionGate>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let events = EventEmitter::new(config.event_capacity);
        Self {
            dispatcher: Dispatcher::new(actuators, gate, audit, events.clone()),
            config,
            feedback: None,
            runs: RwLock::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_feedback_loop(mut self, feedback: Arc<dyn FeedbackLoop>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Runs `plan` from its first step until it completes, fails, is
    /// cancelled, or pauses. Returns the record as it stands at that point.
    pub async fn execute(&self, plan: ExecutionPlan) -> PlanExecution {
        let plan = Arc::new(plan);
        if self.closed.load(Ordering::SeqCst) {
            return PlanExecution::rejected(plan, EngineError::Closed.into());
        }

        let (execution, control) = {
            let mut runs = self.runs.write().await;
            if let Some(existing) = runs.get(&plan.id) {
                // A cancelled run stays owned by its loop until that loop exits.
                if !existing.execution.status.is_terminal() || existing.control.is_active() {
                    log::warn!("plan {} is already executing; request rejected", plan.id);
                    return PlanExecution::rejected(
                        plan.clone(),
                        AppError::engine_fault(format!(
                            "plan {} already has an active execution",
                            plan.id
                        )),
                    );
                }
            }
            let mut execution = PlanExecution::new(Arc::clone(&plan));
            execution.status = ExecutionStatus::Running;
            let control = Arc::new(RunControl::new());
            runs.insert(
                plan.id.clone(),
                RunEntry {
                    execution: execution.clone(),
                    control: Arc::clone(&control),
                },
            );
            (execution, control)
        };

        log::info!(
            "executing plan {} ({} step(s))",
            plan.id,
            plan.steps.len()
        );
        self.events
            .emit(ExecutionEvent::ExecutionStarted { execution });

        match self.run_loop(&plan.id, &control, 0).await {
            Ok(execution) => execution,
            Err(err) => PlanExecution::rejected(plan, err.into()),
        }
    }

    /// Requests a pause at the next step boundary. Only a running plan can
    /// be paused.
    pub async fn pause(&self, plan_id: &str) -> bool {
        let runs = self.runs.read().await;
        match runs.get(plan_id) {
            Some(entry) if entry.execution.status == ExecutionStatus::Running => {
                entry.control.pause_requested.store(true, Ordering::SeqCst);
                log::info!("pause requested for plan {}", plan_id);
                true
            }
            _ => false,
        }
    }

    /// Continues a paused plan at its current step. A pause that was
    /// requested but not yet reached is withdrawn instead.
    pub async fn resume(&self, plan_id: &str) -> Option<PlanExecution> {
        let (snapshot, control) = {
            let mut runs = self.runs.write().await;
            let entry = runs.get_mut(plan_id)?;
            match entry.execution.status {
                ExecutionStatus::Paused => {
                    if let Some(PauseReason::ConfirmationRequired { step_index, .. }) =
                        entry.execution.pause_reason.take()
                    {
                        entry
                            .control
                            .confirmed_step
                            .store(step_index, Ordering::SeqCst);
                    }
                    entry.execution.status = ExecutionStatus::Running;
                    (entry.execution.clone(), Arc::clone(&entry.control))
                }
                ExecutionStatus::Running
                    if entry.control.pause_requested.swap(false, Ordering::SeqCst) =>
                {
                    return Some(entry.execution.clone());
                }
                _ => return None,
            }
        };

        log::info!(
            "resuming plan {} at step {}",
            plan_id,
            snapshot.current_step_index
        );
        let plan = Arc::clone(&snapshot.plan);
        let start = snapshot.current_step_index;
        self.events
            .emit(ExecutionEvent::ExecutionResumed { execution: snapshot });

        Some(match self.run_loop(plan_id, &control, start).await {
            Ok(execution) => execution,
            Err(err) => PlanExecution::rejected(plan, err.into()),
        })
    }

    /// Marks a plan cancelled. A step already in flight finishes and is
    /// recorded, but no further step starts. A step waiting on user input or
    /// an API retry stops waiting.
    pub async fn cancel(&self, plan_id: &str) -> bool {
        let snapshot = {
            let mut runs = self.runs.write().await;
            let Some(entry) = runs.get_mut(plan_id) else {
                return false;
            };
            let status = entry.execution.status;
            if status.is_terminal() || status == ExecutionStatus::RollingBack {
                return false;
            }
            entry.execution.status = ExecutionStatus::Cancelled;
            entry.execution.completed_at = Some(Utc::now());
            entry.execution.pause_reason = None;
            entry.control.cancel.cancel();
            entry.execution.clone()
        };

        self.dispatcher.abandon_input(plan_id).await;
        log::info!("plan {} cancelled", plan_id);
        self.events
            .emit(ExecutionEvent::ExecutionCancelled { execution: snapshot });
        true
    }

    /// Answers a pending `user_input` step.
    pub async fn provide_input(&self, plan_id: &str, value: impl Into<String>) -> bool {
        self.dispatcher.provide_input(plan_id, value.into()).await
    }

    pub async fn get_execution(&self, plan_id: &str) -> Option<PlanExecution> {
        self.runs
            .read()
            .await
            .get(plan_id)
            .map(|entry| entry.execution.clone())
    }

    pub async fn get_all_executions(&self) -> Vec<PlanExecution> {
        let mut all: Vec<PlanExecution> = self
            .runs
            .read()
            .await
            .values()
            .map(|entry| entry.execution.clone())
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Drops terminal runs from the registry. Returns how many were removed.
    pub async fn clear_completed(&self) -> usize {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, entry| {
            !entry.execution.status.is_terminal() || entry.control.is_active()
        });
        before - runs.len()
    }

    /// Releases held actuator state. Later `execute` calls are rejected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("closing plan execution engine");
        self.dispatcher.close().await;
    }

    async fn run_loop(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
        start: usize,
    ) -> Result<PlanExecution, EngineError> {
        let _active = ActiveLoop::enter(Arc::clone(control));
        let plan = self
            .with_execution(plan_id, control, |execution| Arc::clone(&execution.plan))
            .await?;
        let total = plan.steps.len();

        for index in start..total {
            let step = &plan.steps[index];
            if let Some(stopped) = self.checkpoint(plan_id, control, index, step).await? {
                return Ok(stopped);
            }

            self.events.emit(ExecutionEvent::StepStarted {
                plan_id: plan_id.to_string(),
                step_index: index,
                step: step.clone(),
            });

            let started_at = Utc::now();
            let (outcome, failure) = match self.run_step(plan_id, &control.cancel, step).await {
                Ok(dispatched) if dispatched.outcome.success => (dispatched.outcome, None),
                Ok(dispatched) => {
                    let error = step_error(step, &dispatched);
                    (dispatched.outcome, Some((error, self.config.auto_rollback)))
                }
                Err(fault) => {
                    log::error!("plan {} step {} faulted: {}", plan_id, step.id, fault);
                    let outcome = ActionOutcome::failed(fault.to_string());
                    (outcome, Some((AppError::from(fault), false)))
                }
            };

            let result = StepExecutionResult {
                step_index: index,
                step: step.clone(),
                outcome,
                started_at,
                completed_at: Utc::now(),
            };
            let cancelled = self
                .with_execution(plan_id, control, |execution| {
                    execution.step_results.push(result.clone());
                    execution.status == ExecutionStatus::Cancelled
                })
                .await?;
            self.events.emit(ExecutionEvent::StepCompleted {
                plan_id: plan_id.to_string(),
                result,
            });

            if cancelled {
                return self.snapshot(plan_id, control).await;
            }
            if let Some((error, rollback)) = failure {
                return self.finish_failed(plan_id, control, error, rollback).await;
            }
            if index + 1 < total && self.config.step_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.step_delay_ms)).await;
            }
        }

        self.finish_completed(plan_id, control).await
    }

    /// Step boundary: the only place cancel, pause and confirmation are
    /// observed. Returns the record when the loop must stop here.
    async fn checkpoint(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
        index: usize,
        step: &PlanStep,
    ) -> Result<Option<PlanExecution>, EngineError> {
        let needs_confirmation = self.config.require_confirmation_for_high_risk
            && step.risk_level == RiskLevel::High
            && control.confirmed_step.load(Ordering::SeqCst) != index;

        let paused = {
            let mut runs = self.runs.write().await;
            let execution = owned_execution(&mut runs, plan_id, control)?;
            execution.current_step_index = index;
            if execution.status == ExecutionStatus::Cancelled {
                return Ok(Some(execution.clone()));
            }

            let reason = if control.pause_requested.swap(false, Ordering::SeqCst) {
                PauseReason::Requested
            } else if needs_confirmation {
                PauseReason::ConfirmationRequired {
                    step_index: index,
                    step_id: step.id.clone(),
                }
            } else {
                return Ok(None);
            };
            execution.status = ExecutionStatus::Paused;
            execution.pause_reason = Some(reason.clone());
            (execution.clone(), reason)
        };

        let (execution, reason) = paused;
        match &reason {
            PauseReason::Requested => log::info!("plan {} paused before step {}", plan_id, index),
            PauseReason::ConfirmationRequired { step_id, .. } => log::info!(
                "plan {} paused: step {} is high risk and needs confirmation",
                plan_id,
                step_id
            ),
        }
        self.events.emit(ExecutionEvent::ExecutionPaused {
            execution: execution.clone(),
            reason,
        });
        Ok(Some(execution))
    }

    async fn run_step(
        &self,
        plan_id: &str,
        cancel: &CancellationToken,
        step: &PlanStep,
    ) -> Result<Dispatched, EngineError> {
        step.action.validate(&step.id)?;
        match self.feedback_for(step) {
            Some(feedback) => {
                let handle = DispatchHandle::new(&self.dispatcher, plan_id, cancel);
                let outcome = feedback.execute_with_feedback(step, &handle).await;
                Ok(handle.finish(outcome))
            }
            None => {
                self.dispatcher
                    .dispatch(plan_id, step, DispatchPhase::Forward, cancel)
                    .await
            }
        }
    }

    fn feedback_for(&self, step: &PlanStep) -> Option<&Arc<dyn FeedbackLoop>> {
        if !self.config.enable_feedback_loop
            || step.expected_state.is_none()
            || !step.action.category().supports_feedback()
        {
            return None;
        }
        self.feedback.as_ref()
    }

    async fn finish_completed(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
    ) -> Result<PlanExecution, EngineError> {
        let execution = self
            .with_execution(plan_id, control, |execution| {
                if execution.status == ExecutionStatus::Cancelled {
                    return None;
                }
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(Utc::now());
                Some(execution.clone())
            })
            .await?;
        let Some(execution) = execution else {
            return self.snapshot(plan_id, control).await;
        };

        log::info!(
            "plan {} completed ({} step(s))",
            plan_id,
            execution.step_results.len()
        );
        self.events.emit(ExecutionEvent::ExecutionCompleted {
            execution: execution.clone(),
        });
        Ok(execution)
    }

    async fn finish_failed(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
        error: AppError,
        rollback: bool,
    ) -> Result<PlanExecution, EngineError> {
        log::warn!("plan {} failed: {}", plan_id, error.message);
        let proceed = self
            .with_execution(plan_id, control, |execution| {
                if execution.status == ExecutionStatus::Cancelled {
                    return false;
                }
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error);
                true
            })
            .await?;
        if !proceed {
            return self.snapshot(plan_id, control).await;
        }

        if rollback {
            self.rollback(plan_id, control).await?;
        }

        let execution = self
            .with_execution(plan_id, control, |execution| {
                execution.status = ExecutionStatus::Failed;
                execution.completed_at = Some(Utc::now());
                execution.clone()
            })
            .await?;
        self.events.emit(ExecutionEvent::ExecutionFailed {
            execution: execution.clone(),
        });
        Ok(execution)
    }

    async fn snapshot(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
    ) -> Result<PlanExecution, EngineError> {
        self.with_execution(plan_id, control, |execution| execution.clone())
            .await
    }

    /// Applies `f` to the run owned by `control`. A loop whose run was
    /// cleared or replaced gets `ExecutionNotFound` and writes nothing.
    async fn with_execution<R>(
        &self,
        plan_id: &str,
        control: &Arc<RunControl>,
        f: impl FnOnce(&mut PlanExecution) -> R,
    ) -> Result<R, EngineError> {
        let mut runs = self.runs.write().await;
        Ok(f(owned_execution(&mut runs, plan_id, control)?))
    }
}

fn owned_execution<'a>(
    runs: &'a mut HashMap<String, RunEntry>,
    plan_id: &str,
    control: &Arc<RunControl>,
) -> Result<&'a mut PlanExecution, EngineError> {
    match runs.get_mut(plan_id) {
        Some(entry) if Arc::ptr_eq(&entry.control, control) => Ok(&mut entry.execution),
        _ => Err(EngineError::ExecutionNotFound(plan_id.to_string())),
    }
}

fn step_error(step: &PlanStep, dispatched: &Dispatched) -> AppError {
    let detail = dispatched
        .outcome
        .error
        .clone()
        .unwrap_or_else(|| "unknown error".to_string());
    if dispatched.denied {
        return AppError::permission_denied(detail);
    }
    AppError::actuator(
        format!(
            "step {} ({}) failed: {}",
            step.id,
            step.action.kind(),
            detail
        ),
        Some(detail),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::mock::MockActuators;
    use crate::audit::{AuditEventKind, MemoryAuditLog};
    use crate::errors::ErrorKind;
    use crate::events;
    use crate::feedback::{RetryingFeedbackLoop, StateVerifier};
    use crate::config::FeedbackConfig;
    use crate::permission::{
        AllowAllGate, PermissionContext, PermissionDecision, PermissionPolicy, PolicyPermissionGate,
    };
    use crate::plan::{
        ActionCategory, ExpectedState, FileWriteParams, FolderDeleteParams, PathParams,
        PlaceholderParams, SelectorParams, ShellParams, StepAction, UrlParams, UserInputParams,
        WaitParams,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    fn shell(id: &str, command: &str) -> PlanStep {
        PlanStep::new(
            id,
            StepAction::Shell(ShellParams {
                command: command.to_string(),
                cwd: None,
                timeout_ms: None,
                env: BTreeMap::new(),
            }),
        )
    }

    fn create_folder(id: &str, path: &str) -> PlanStep {
        PlanStep::new(
            id,
            StepAction::FolderCreate(PathParams {
                path: path.to_string(),
            }),
        )
        .with_rollback(PlanStep::new(
            format!("{}-undo", id),
            StepAction::FolderDelete(FolderDeleteParams {
                path: path.to_string(),
                recursive: true,
            }),
        ))
    }

    fn write_file(id: &str, path: &str) -> PlanStep {
        PlanStep::new(
            id,
            StepAction::FileWrite(FileWriteParams {
                path: path.to_string(),
                content: "hello".to_string(),
                append: false,
            }),
        )
    }

    fn ask(id: &str) -> PlanStep {
        PlanStep::new(
            id,
            StepAction::UserInput(UserInputParams {
                prompt: "who?".to_string(),
                timeout_ms: None,
            }),
        )
    }

    struct Harness {
        mocks: MockActuators,
        audit: Arc<MemoryAuditLog>,
        engine: Arc<PlanExecutionEngine>,
    }

    fn harness_with(config: EngineConfig, gate: Arc<dyn PermissionGate>) -> Harness {
        let mocks = MockActuators::new();
        let audit = Arc::new(MemoryAuditLog::new());
        let engine = PlanExecutionEngine::new(config, mocks.actuators(), gate, audit.clone());
        Harness {
            mocks,
            audit,
            engine: Arc::new(engine),
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), Arc::new(AllowAllGate))
    }

    fn drain(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    async fn wait_for(rx: &mut broadcast::Receiver<ExecutionEvent>, name: &str) -> ExecutionEvent {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "ok",
            vec![
                shell("a", "echo 1"),
                write_file("b", "/tmp/out.txt"),
                shell("c", "echo 2"),
            ],
        );
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results.len(), 3);
        assert_eq!(execution.current_step_index, 2);
        assert!(execution.completed_at.is_some());
        assert!(execution.error.is_none());
        let order: Vec<&str> = execution
            .step_results
            .iter()
            .map(|r| r.step.id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(h.mocks.log.verbs(), vec!["shell", "file_write", "shell"]);

        let audited = h.audit.entries_for("ok");
        assert_eq!(audited.len(), 3);
        assert!(audited
            .iter()
            .all(|e| e.event == AuditEventKind::ActionExecuted));
    }

    #[tokio::test]
    async fn empty_plan_completes() {
        let h = harness();
        let execution = h.engine.execute(ExecutionPlan::new("empty", vec![])).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.current_step_index, 0);
        assert!(execution.step_results.is_empty());
    }

    #[tokio::test]
    async fn failed_step_rolls_back_the_folder_only() {
        let h = harness();
        h.mocks.fail_on("shell", "false");
        let plan = ExecutionPlan::new(
            "scenario",
            vec![
                create_folder("mkdir", "/tmp/x"),
                write_file("write", "/tmp/x/a.txt"),
                shell("run", "false"),
            ],
        );
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_results.len(), 3);
        assert_eq!(h.mocks.log.targets("folder_delete"), vec!["/tmp/x"]);
        assert_eq!(h.mocks.log.count("file_delete"), 0);
        assert_eq!(execution.rollback_results.len(), 1);
        assert_eq!(execution.rollback_results[0].step_index, 0);

        let error = execution.error.as_ref().expect("error recorded");
        assert_eq!(error.kind, ErrorKind::ActuatorError);
        assert!(error.message.contains("run"));
        assert_eq!(
            execution.failed_step().map(|r| r.step.id.as_str()),
            Some("run")
        );
    }

    #[tokio::test]
    async fn rollback_runs_most_recent_first() {
        let h = harness();
        h.mocks.fail("api_call");
        let plan = ExecutionPlan::new(
            "lifo",
            vec![
                create_folder("a", "/tmp/a"),
                create_folder("b", "/tmp/b"),
                shell("noop", "true"),
                create_folder("c", "/tmp/c"),
                PlanStep::new(
                    "boom",
                    StepAction::ApiCall(crate::plan::ApiCallParams {
                        method: "POST".to_string(),
                        url: "https://example.com/hook".to_string(),
                        headers: BTreeMap::new(),
                        body: None,
                        timeout_ms: None,
                    }),
                ),
            ],
        );
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            h.mocks.log.targets("folder_delete"),
            vec!["/tmp/c", "/tmp/b", "/tmp/a"]
        );
        let compensated: Vec<usize> = execution
            .rollback_results
            .iter()
            .map(|r| r.step_index)
            .collect();
        assert_eq!(compensated, vec![3, 1, 0]);
    }

    #[tokio::test]
    async fn compensating_failure_does_not_stop_the_sweep() {
        let h = harness();
        h.mocks.fail_on("folder_delete", "/tmp/b");
        h.mocks.fail_on("shell", "false");
        let plan = ExecutionPlan::new(
            "sweep",
            vec![
                create_folder("a", "/tmp/a"),
                create_folder("b", "/tmp/b"),
                shell("fail", "false"),
            ],
        );
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            h.mocks.log.targets("folder_delete"),
            vec!["/tmp/b", "/tmp/a"]
        );
        assert!(!execution.rollback_results[0].outcome.success);
        assert!(execution.rollback_results[1].outcome.success);
        let rollback_error = execution.rollback_error.as_ref().expect("rollback error");
        assert_eq!(rollback_error.kind, ErrorKind::RollbackError);
        assert_eq!(rollback_error.message, "1 of 2 compensating step(s) failed");
        assert_eq!(rollback_error.details.as_deref(), Some("b-undo"));
        assert_eq!(
            execution.error.as_ref().map(|e| e.kind.clone()),
            Some(ErrorKind::ActuatorError)
        );
        let kinds: Vec<AuditEventKind> = h.audit.entries().iter().map(|e| e.event).collect();
        assert!(kinds.contains(&AuditEventKind::RollbackFailed));
        assert!(kinds.contains(&AuditEventKind::RollbackExecuted));
    }

    #[tokio::test]
    async fn no_rollback_when_disabled() {
        let config = EngineConfig {
            auto_rollback: false,
            ..EngineConfig::default()
        };
        let h = harness_with(config, Arc::new(AllowAllGate));
        h.mocks.fail_on("shell", "false");
        let plan = ExecutionPlan::new(
            "manual",
            vec![create_folder("a", "/tmp/a"), shell("fail", "false")],
        );
        let execution = h.engine.execute(plan).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(h.mocks.log.count("folder_delete"), 0);
        assert!(!execution.rollback_ran());
        assert!(execution.rollback_error.is_none());
    }

    #[tokio::test]
    async fn denied_shell_never_runs() {
        let gate = Arc::new(PolicyPermissionGate::new(
            PermissionPolicy::default().deny_category(ActionCategory::Shell),
        ));
        let h = harness_with(EngineConfig::default(), gate);
        let plan = ExecutionPlan::new("denied", vec![shell("s", "ls")]);
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(h.mocks.log.count("shell"), 0);
        let outcome = &execution.step_results[0].outcome;
        assert!(!outcome.success);
        assert!(outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Permission denied"));
        assert_eq!(
            execution.error.map(|e| e.kind),
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(
            h.audit.entries()[0].event,
            AuditEventKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn malformed_step_faults_without_rollback() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "fault",
            vec![create_folder("a", "/tmp/a"), shell("empty", "   ")],
        );
        let execution = h.engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_results.len(), 2);
        assert_eq!(
            execution.error.as_ref().map(|e| e.kind.clone()),
            Some(ErrorKind::EngineFault)
        );
        assert_eq!(h.mocks.log.count("folder_delete"), 0);
        assert_eq!(h.mocks.log.count("shell"), 0);
    }

    #[tokio::test]
    async fn placeholders_complete() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "flow",
            vec![
                PlanStep::new("if", StepAction::Condition(PlaceholderParams::default())),
                PlanStep::new("each", StepAction::Loop(PlaceholderParams::default())),
            ],
        );
        let execution = h.engine.execute(plan).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.step_results.iter().all(|r| r.outcome.success));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_resume_continues_at_next_step() {
        let h = harness();
        h.mocks.delay("shell", Duration::from_millis(200));
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new(
            "pausable",
            vec![shell("a", "one"), shell("b", "two"), shell("c", "three")],
        );

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        wait_for(&mut rx, events::STEP_STARTED).await;
        assert!(h.engine.pause("pausable").await);

        let paused = running.await.expect("join");
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.pause_reason, Some(PauseReason::Requested));
        assert_eq!(paused.current_step_index, 1);
        assert_eq!(paused.step_results.len(), 1);
        assert!(!h.engine.pause("pausable").await);

        let resumed = h.engine.resume("pausable").await.expect("resumed");
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(h.mocks.log.targets("shell"), vec!["one", "two", "three"]);
        let indices: Vec<usize> = resumed.step_results.iter().map(|r| r.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn resume_of_unpaused_run_is_none() {
        let h = harness();
        h.engine
            .execute(ExecutionPlan::new("done", vec![shell("a", "x")]))
            .await;
        assert!(h.engine.resume("done").await.is_none());
        assert!(h.engine.resume("missing").await.is_none());
    }

    #[tokio::test]
    async fn high_risk_step_waits_for_confirmation() {
        let h = harness();
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new(
            "risky",
            vec![
                shell("safe", "ls"),
                shell("danger", "rm -r build").with_risk(RiskLevel::High),
                shell("after", "ls -la"),
            ],
        );
        let paused = h.engine.execute(plan).await;

        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(
            paused.pause_reason,
            Some(PauseReason::ConfirmationRequired {
                step_index: 1,
                step_id: "danger".to_string(),
            })
        );
        assert_eq!(h.mocks.log.count("shell"), 1);
        assert!(drain(&mut rx).contains(&events::EXECUTION_PAUSED));

        let done = h.engine.resume("risky").await.expect("resumed");
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.pause_reason.is_none());
        assert_eq!(
            h.mocks.log.targets("shell"),
            vec!["ls", "rm -r build", "ls -la"]
        );
    }

    #[tokio::test]
    async fn confirmation_can_be_disabled() {
        let config = EngineConfig {
            require_confirmation_for_high_risk: false,
            ..EngineConfig::default()
        };
        let h = harness_with(config, Arc::new(AllowAllGate));
        let plan = ExecutionPlan::new(
            "trusted",
            vec![shell("danger", "make clean").with_risk(RiskLevel::High)],
        );
        assert_eq!(
            h.engine.execute(plan).await.status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_in_flight_step_finish() {
        let h = harness();
        h.mocks.delay("shell", Duration::from_millis(500));
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new(
            "cancel",
            vec![shell("a", "slow"), shell("b", "never")],
        );

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        wait_for(&mut rx, events::STEP_STARTED).await;
        assert!(h.engine.cancel("cancel").await);
        assert_eq!(
            h.engine.get_execution("cancel").await.map(|e| e.status),
            Some(ExecutionStatus::Cancelled)
        );

        let execution = running.await.expect("join");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.step_results.len(), 1);
        assert!(execution.step_results[0].outcome.success);
        assert_eq!(h.mocks.log.targets("shell"), vec!["slow"]);
        assert!(!h.engine.cancel("cancel").await);
    }

    #[tokio::test]
    async fn cancel_of_paused_run_releases_it() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "held",
            vec![shell("danger", "reboot").with_risk(RiskLevel::High)],
        );
        h.engine.execute(plan).await;
        assert!(h.engine.cancel("held").await);

        let execution = h.engine.get_execution("held").await.expect("registered");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.step_results.is_empty());
        assert!(h.engine.resume("held").await.is_none());
    }

    #[tokio::test]
    async fn user_input_is_answered_out_of_band() {
        let h = harness();
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new("form", vec![ask("name"), shell("greet", "echo hi")]);

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        let event = wait_for(&mut rx, events::INPUT_REQUIRED).await;
        assert_eq!(event.plan_id(), "form");
        assert!(h.engine.provide_input("form", "Ada").await);

        let execution = running.await.expect("join");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.step_results[0].outcome.output.as_deref(),
            Some("Ada")
        );
    }

    #[tokio::test]
    async fn cancel_releases_pending_input() {
        let h = harness();
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new("abandoned", vec![ask("name"), shell("next", "ls")]);

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        wait_for(&mut rx, events::INPUT_REQUIRED).await;
        assert!(h.engine.cancel("abandoned").await);

        let execution = running.await.expect("join");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.step_results.len(), 1);
        assert_eq!(
            execution.step_results[0].outcome.error.as_deref(),
            Some("input request was cancelled")
        );
        assert_eq!(h.mocks.log.count("shell"), 0);
    }

    struct SlowGate(Duration);

    #[async_trait]
    impl PermissionGate for SlowGate {
        async fn check_permission(&self, _context: &PermissionContext) -> PermissionDecision {
            tokio::time::sleep(self.0).await;
            PermissionDecision::allow()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_input_is_requested_still_stops_the_step() {
        let h = harness_with(
            EngineConfig::default(),
            Arc::new(SlowGate(Duration::from_millis(100))),
        );
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new("early", vec![ask("name"), shell("next", "ls")]);

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        // The step is still in the gate, so no input request exists yet.
        wait_for(&mut rx, events::STEP_STARTED).await;
        assert!(h.engine.cancel("early").await);

        let execution = tokio::time::timeout(Duration::from_secs(60), running)
            .await
            .expect("run stopped")
            .expect("join");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.step_results.len(), 1);
        assert_eq!(
            execution.step_results[0].outcome.error.as_deref(),
            Some("input request was cancelled")
        );
        assert_eq!(h.mocks.log.count("shell"), 0);
        assert!(!h.engine.provide_input("early", "late").await);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_is_rejected_until_the_cancelled_loop_exits() {
        let h = harness();
        h.mocks.delay("shell", Duration::from_millis(500));
        let mut rx = h.engine.subscribe();
        let old = ExecutionPlan::new(
            "rerun",
            vec![shell("a", "old-slow"), shell("b", "old-never")],
        );
        let new = ExecutionPlan::new("rerun", vec![shell("a", "new-1"), shell("b", "new-2")]);

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(old).await })
        };
        wait_for(&mut rx, events::STEP_STARTED).await;
        assert!(h.engine.cancel("rerun").await);

        let rejected = h.engine.execute(new.clone()).await;
        assert_eq!(rejected.status, ExecutionStatus::Failed);
        assert_eq!(
            rejected.error.as_ref().map(|e| e.kind.clone()),
            Some(ErrorKind::EngineFault)
        );

        let cancelled = running.await.expect("join");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.step_results.len(), 1);
        assert_eq!(h.mocks.log.targets("shell"), vec!["old-slow"]);

        let rerun = h.engine.execute(new).await;
        assert_eq!(rerun.status, ExecutionStatus::Completed);
        assert_eq!(rerun.step_results.len(), 2);
        assert_eq!(
            h.mocks.log.targets("shell"),
            vec!["old-slow", "new-1", "new-2"]
        );
    }

    #[tokio::test]
    async fn loop_cannot_write_into_a_replaced_run() {
        let h = harness();
        let plan = Arc::new(ExecutionPlan::new("owned", vec![shell("a", "ls")]));
        let stale = Arc::new(RunControl::new());
        let current = Arc::new(RunControl::new());
        h.engine.runs.write().await.insert(
            "owned".to_string(),
            RunEntry {
                execution: PlanExecution::new(Arc::clone(&plan)),
                control: Arc::clone(&current),
            },
        );

        let err = h
            .engine
            .with_execution("owned", &stale, |execution| {
                execution.status = ExecutionStatus::Completed
            })
            .await
            .expect_err("stale control");
        assert!(matches!(err, EngineError::ExecutionNotFound(_)));
        assert_eq!(
            h.engine.get_execution("owned").await.map(|e| e.status),
            Some(ExecutionStatus::Pending)
        );
        assert!(h
            .engine
            .with_execution("owned", &current, |_| ())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rollback_blocked_by_changed_policy() {
        let gate = Arc::new(PolicyPermissionGate::new(PermissionPolicy::default()));
        let h = harness_with(EngineConfig::default(), gate.clone());
        h.mocks.fail_on("shell", "false");
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new(
            "blocked",
            vec![
                create_folder("mkdir", "/tmp/x"),
                ask("confirm"),
                shell("fail", "false"),
            ],
        );

        let running = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.execute(plan).await })
        };
        wait_for(&mut rx, events::INPUT_REQUIRED).await;
        gate.set_policy(PermissionPolicy::default().deny_category(ActionCategory::Folder))
            .await;
        assert!(h.engine.provide_input("blocked", "yes").await);

        let execution = running.await.expect("join");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(h.mocks.log.count("folder_delete"), 0);
        assert_eq!(execution.rollback_results.len(), 1);
        assert!(execution.rollback_results[0]
            .outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Permission denied"));
        assert_eq!(
            execution.rollback_error.map(|e| e.kind),
            Some(ErrorKind::RollbackError)
        );
        assert!(h
            .audit
            .entries()
            .iter()
            .any(|e| e.event == AuditEventKind::PermissionDenied && e.context.step_id == "mkdir-undo"));
    }

    #[tokio::test]
    async fn duplicate_execute_is_rejected() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "dup",
            vec![shell("danger", "rm -r out").with_risk(RiskLevel::High)],
        );
        let first = h.engine.execute(plan.clone()).await;
        assert_eq!(first.status, ExecutionStatus::Paused);

        let second = h.engine.execute(plan).await;
        assert_eq!(second.status, ExecutionStatus::Failed);
        assert_eq!(
            second.error.map(|e| e.kind),
            Some(ErrorKind::EngineFault)
        );
        assert_eq!(
            h.engine.get_execution("dup").await.map(|e| e.status),
            Some(ExecutionStatus::Paused)
        );
    }

    #[tokio::test]
    async fn finished_plan_can_run_again() {
        let h = harness();
        let plan = ExecutionPlan::new("again", vec![shell("a", "ls")]);
        h.engine.execute(plan.clone()).await;
        let second = h.engine.execute(plan).await;
        assert_eq!(second.status, ExecutionStatus::Completed);
        assert_eq!(h.mocks.log.count("shell"), 2);
    }

    #[tokio::test]
    async fn emits_named_signals_in_order() {
        let h = harness();
        h.mocks.fail_on("shell", "false");
        let mut rx = h.engine.subscribe();
        let plan = ExecutionPlan::new(
            "signals",
            vec![create_folder("mkdir", "/tmp/s"), shell("fail", "false")],
        );
        h.engine.execute(plan).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                events::EXECUTION_STARTED,
                events::STEP_STARTED,
                events::STEP_COMPLETED,
                events::STEP_STARTED,
                events::STEP_COMPLETED,
                events::ROLLBACK_STARTED,
                events::ROLLBACK_STEP,
                events::ROLLBACK_STEP_COMPLETED,
                events::ROLLBACK_COMPLETED,
                events::EXECUTION_FAILED,
            ]
        );
    }

    #[tokio::test]
    async fn registry_queries_and_clear() {
        let h = harness();
        h.engine
            .execute(ExecutionPlan::new("one", vec![shell("a", "ls")]))
            .await;
        h.engine
            .execute(ExecutionPlan::new("two", vec![shell("a", "ls")]))
            .await;
        h.engine
            .execute(ExecutionPlan::new(
                "three",
                vec![shell("a", "halt").with_risk(RiskLevel::High)],
            ))
            .await;

        let ids: Vec<String> = h
            .engine
            .get_all_executions()
            .await
            .into_iter()
            .map(|e| e.plan_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "one");

        assert_eq!(h.engine.clear_completed().await, 2);
        let remaining = h.engine.get_all_executions().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].plan_id, "three");
        assert!(h.engine.get_execution("one").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn step_delay_is_applied_between_steps() {
        let config = EngineConfig {
            step_delay_ms: 1_000,
            ..EngineConfig::default()
        };
        let h = harness_with(config, Arc::new(AllowAllGate));
        let wait = |id: &str| PlanStep::new(id, StepAction::Wait(WaitParams { duration_ms: 0 }));
        let started = tokio::time::Instant::now();
        let execution = h
            .engine
            .execute(ExecutionPlan::new("slow", vec![wait("a"), wait("b"), wait("c")]))
            .await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(started.elapsed() >= Duration::from_millis(2_000));
        assert!(started.elapsed() < Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_runs() {
        let h = harness();
        let plan = ExecutionPlan::new(
            "web",
            vec![PlanStep::new(
                "open",
                StepAction::BrowserNavigate(UrlParams {
                    url: "https://example.com".to_string(),
                }),
            )],
        );
        assert_eq!(
            h.engine.execute(plan).await.status,
            ExecutionStatus::Completed
        );

        h.engine.close().await;
        h.engine.close().await;
        assert_eq!(h.mocks.log.count("browser_shutdown"), 1);

        let rejected = h
            .engine
            .execute(ExecutionPlan::new("late", vec![shell("a", "ls")]))
            .await;
        assert_eq!(rejected.status, ExecutionStatus::Failed);
        assert_eq!(
            rejected.error.and_then(|e| e.code).as_deref(),
            Some("engine_closed")
        );
        assert!(h.engine.get_execution("late").await.is_none());
    }

    struct AlwaysReached {
        checks: AtomicU32,
    }

    #[async_trait]
    impl StateVerifier for AlwaysReached {
        async fn verify(&self, _step: &PlanStep, _expected: &ExpectedState) -> Result<bool, String> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn expected_state_routes_through_feedback_loop() {
        let mocks = MockActuators::new();
        let verifier = Arc::new(AlwaysReached {
            checks: AtomicU32::new(0),
        });
        let engine = PlanExecutionEngine::new(
            EngineConfig::default(),
            mocks.actuators(),
            Arc::new(AllowAllGate),
            Arc::new(MemoryAuditLog::new()),
        )
        .with_feedback_loop(Arc::new(RetryingFeedbackLoop::new(
            verifier.clone(),
            FeedbackConfig::default(),
        )));

        let expected = ExpectedState {
            description: "form submitted".to_string(),
            checks: BTreeMap::new(),
        };
        let plan = ExecutionPlan::new(
            "feedback",
            vec![
                PlanStep::new(
                    "submit",
                    StepAction::BrowserClick(SelectorParams {
                        selector: "#submit".to_string(),
                    }),
                )
                .with_expected_state(expected.clone()),
                // shell is outside the feedback families
                shell("log", "echo done").with_expected_state(expected),
            ],
        );
        let execution = engine.execute(plan).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(verifier.checks.load(Ordering::SeqCst), 1);
        assert_eq!(mocks.log.count("browser_click"), 1);
        assert_eq!(mocks.log.count("shell"), 1);
    }
}
