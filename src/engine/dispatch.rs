use crate::actuator::{ActionOutcome, Actuators, ShellOptions, WindowOp};
use crate::audit::{AuditDecision, AuditEntry, AuditEventKind, AuditLogger};
use crate::errors::EngineError;
use crate::events::{EventEmitter, ExecutionEvent};
use crate::feedback::StepDispatcher;
use crate::permission::{PermissionContext, PermissionGate};
use crate::plan::{PlanStep, StepAction, UserInputParams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Forward,
    Rollback,
}

/// Outcome of one gated dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub outcome: ActionOutcome,
    /// The gate refused the step and no actuator ran.
    pub denied: bool,
}

/// Single-step path: authorize, route to one actuator, audit.
pub struct Dispatcher {
    actuators: Actuators,
    gate: Arc<dyn PermissionGate>,
    audit: Arc<dyn AuditLogger>,
    events: EventEmitter,
    pending_inputs: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl Dispatcher {
    pub fn new(
        actuators: Actuators,
        gate: Arc<dyn PermissionGate>,
        audit: Arc<dyn AuditLogger>,
        events: EventEmitter,
    ) -> Self {
        Self {
            actuators,
            gate,
            audit,
            events,
            pending_inputs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(
        &self,
        plan_id: &str,
        step: &PlanStep,
        phase: DispatchPhase,
        cancel: &CancellationToken,
    ) -> Result<Dispatched, EngineError> {
        step.action.validate(&step.id)?;

        let context = PermissionContext::for_step(plan_id, step);
        let decision = self.gate.check_permission(&context).await;
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "no reason given".to_string());
            let outcome = ActionOutcome::failed(format!("Permission denied: {}", reason));
            self.audit.log(
                AuditEntry::new(
                    AuditEventKind::PermissionDenied,
                    AuditDecision::Denied,
                    context,
                )
                .with_error(reason),
            );
            return Ok(Dispatched {
                outcome,
                denied: true,
            });
        }

        log::debug!(
            "plan {} dispatching {} ({})",
            plan_id,
            step.id,
            step.action.kind()
        );
        let started = Instant::now();
        let outcome = self.route(plan_id, step, cancel).await.timed_from(started);
        if !outcome.success {
            log::warn!(
                "step {} ({}) failed: {}",
                step.id,
                step.action.kind(),
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        let event = match (phase, outcome.success) {
            (DispatchPhase::Forward, true) => AuditEventKind::ActionExecuted,
            (DispatchPhase::Forward, false) => AuditEventKind::ActionFailed,
            (DispatchPhase::Rollback, true) => AuditEventKind::RollbackExecuted,
            (DispatchPhase::Rollback, false) => AuditEventKind::RollbackFailed,
        };
        self.audit
            .log(AuditEntry::new(event, AuditDecision::Allowed, context).with_outcome(&outcome));

        Ok(Dispatched {
            outcome,
            denied: false,
        })
    }

    async fn route(
        &self,
        plan_id: &str,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let acts = &self.actuators;
        match &step.action {
            StepAction::Shell(p) => {
                let options = ShellOptions {
                    cwd: p.cwd.clone(),
                    timeout: p.timeout_ms.map(Duration::from_millis),
                    env: p.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                };
                acts.shell.execute(&p.command, &options).await
            }
            StepAction::FileRead(p) => acts.files.read(&p.path).await,
            StepAction::FileWrite(p) => acts.files.write(&p.path, &p.content, p.append).await,
            StepAction::FileMove(p) => acts.files.move_path(&p.from, &p.to).await,
            StepAction::FileCopy(p) => acts.files.copy(&p.from, &p.to).await,
            StepAction::FileDelete(p) => acts.files.delete(&p.path).await,
            StepAction::FolderCreate(p) => acts.files.create_dir(&p.path).await,
            StepAction::FolderDelete(p) => acts.files.remove_dir(&p.path, p.recursive).await,
            StepAction::UrlOpen(p) => acts.os.open_url(&p.url).await,
            StepAction::AppOpen(p) => acts.os.open_app(&p.name, &p.args).await,
            StepAction::AppClose(p) => acts.os.close_app(&p.name).await,
            StepAction::AppFocus(p) => acts.os.focus_app(&p.name).await,
            StepAction::ClipboardRead => acts.os.clipboard_read().await,
            StepAction::ClipboardWrite(p) => acts.os.clipboard_write(&p.text).await,
            StepAction::Notification(p) => acts.os.notify(&p.title, &p.body).await,
            StepAction::GuiClick(p) => acts.os.click(p.x, p.y, p.button, false).await,
            StepAction::GuiDoubleClick(p) => acts.os.click(p.x, p.y, p.button, true).await,
            StepAction::GuiType(p) => acts.os.type_text(&p.text).await,
            StepAction::GuiHotkey(p) => acts.os.hotkey(&p.keys).await,
            StepAction::GuiScroll(p) => acts.os.scroll(p.dx, p.dy).await,
            StepAction::WindowFocus(p) => acts.os.window(WindowOp::Focus, &p.title).await,
            StepAction::WindowMinimize(p) => acts.os.window(WindowOp::Minimize, &p.title).await,
            StepAction::WindowMaximize(p) => acts.os.window(WindowOp::Maximize, &p.title).await,
            StepAction::WindowClose(p) => acts.os.window(WindowOp::Close, &p.title).await,
            StepAction::ApiCall(p) => acts.api.call(p, cancel).await,
            StepAction::UserInput(p) => self.await_input(plan_id, step, p, cancel).await,
            StepAction::Wait(p) => {
                tokio::time::sleep(Duration::from_millis(p.duration_ms)).await;
                ActionOutcome::ok(format!("waited {}ms", p.duration_ms))
            }
            StepAction::Condition(_) => {
                ActionOutcome::ok("condition steps are not evaluated; continuing with the next step")
            }
            StepAction::Loop(_) => {
                ActionOutcome::ok("loop steps are not expanded; continuing with the next step")
            }
            StepAction::BrowserClose => {
                acts.browser.close().await;
                ActionOutcome::ok_empty()
            }
            browser => self.route_browser(browser).await,
        }
    }

    async fn route_browser(&self, action: &StepAction) -> ActionOutcome {
        let session = match self.actuators.browser.session().await {
            Ok(session) => session,
            Err(err) => return ActionOutcome::failed(format!("browser unavailable: {}", err)),
        };
        match action {
            StepAction::BrowserNavigate(p) => session.navigate(&p.url).await,
            StepAction::BrowserClick(p) => session.click(&p.selector).await,
            StepAction::BrowserType(p) => session.type_text(&p.selector, &p.text).await,
            StepAction::BrowserSelect(p) => session.select(&p.selector, &p.value).await,
            StepAction::BrowserHover(p) => session.hover(&p.selector).await,
            StepAction::BrowserScroll(p) => session.scroll(p.dx, p.dy).await,
            StepAction::BrowserWait(p) => session.wait_for(&p.selector, p.timeout_ms).await,
            StepAction::BrowserExtract(p) => session.extract(&p.selector).await,
            StepAction::BrowserScreenshot(p) => session.screenshot(p.path.as_deref()).await,
            StepAction::BrowserEvaluate(p) => session.evaluate(&p.script).await,
            StepAction::BrowserBack => session.back().await,
            other => ActionOutcome::failed(format!("{} is not a browser action", other.kind())),
        }
    }

    /// Suspends until `provide_input` answers, the timeout fires, or the
    /// run is cancelled.
    async fn await_input(
        &self,
        plan_id: &str,
        step: &PlanStep,
        params: &UserInputParams,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let (tx, rx) = oneshot::channel();
        self.pending_inputs
            .lock()
            .await
            .insert(plan_id.to_string(), tx);
        self.events.emit(ExecutionEvent::InputRequired {
            plan_id: plan_id.to_string(),
            step: step.clone(),
            prompt: params.prompt.clone(),
        });

        let timeout = params.timeout_ms.map(Duration::from_millis);
        let outcome = tokio::select! {
            // A cancel issued before the waiter was registered is seen here too.
            _ = cancel.cancelled() => ActionOutcome::failed("input request was cancelled"),
            received = receive_input(rx, timeout) => match received {
                Some(Ok(value)) => ActionOutcome::ok(value),
                Some(Err(_)) => ActionOutcome::failed("input request was cancelled"),
                None => ActionOutcome::failed("timed out waiting for user input"),
            },
        };
        self.pending_inputs.lock().await.remove(plan_id);
        outcome
    }

    /// Answers the pending input request of `plan_id`. False if none is waiting.
    pub async fn provide_input(&self, plan_id: &str, value: String) -> bool {
        let sender = self.pending_inputs.lock().await.remove(plan_id);
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// Drops the pending input request of `plan_id`, failing the waiting step.
    pub async fn abandon_input(&self, plan_id: &str) {
        self.pending_inputs.lock().await.remove(plan_id);
    }

    pub async fn close(&self) {
        self.pending_inputs.lock().await.clear();
        self.actuators.close().await;
    }
}

/// `None` when the timeout elapsed first.
async fn receive_input(
    rx: oneshot::Receiver<String>,
    timeout: Option<Duration>,
) -> Option<Result<String, oneshot::error::RecvError>> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, rx).await.ok(),
        None => Some(rx.await),
    }
}

/// Engine handle passed to a feedback loop for one step.
pub struct DispatchHandle<'a> {
    dispatcher: &'a Dispatcher,
    plan_id: &'a str,
    cancel: &'a CancellationToken,
    denied: AtomicBool,
}

impl<'a> DispatchHandle<'a> {
    pub fn new(
        dispatcher: &'a Dispatcher,
        plan_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            plan_id,
            cancel,
            denied: AtomicBool::new(false),
        }
    }

    /// Wraps the feedback loop's final outcome.
    pub fn finish(self, outcome: ActionOutcome) -> Dispatched {
        let denied = !outcome.success && self.denied.load(Ordering::SeqCst);
        Dispatched { outcome, denied }
    }
}

#[async_trait]
impl StepDispatcher for DispatchHandle<'_> {
    async fn dispatch_step(&self, step: &PlanStep) -> ActionOutcome {
        match self
            .dispatcher
            .dispatch(self.plan_id, step, DispatchPhase::Forward, self.cancel)
            .await
        {
            Ok(dispatched) => {
                if dispatched.denied {
                    self.denied.store(true, Ordering::SeqCst);
                }
                dispatched.outcome
            }
            Err(err) => ActionOutcome::failed(err.to_string()),
        }
    }
}
