//! Recording actuators for tests and dry runs.
//!
//! Every verb is recorded in a shared `MockLog`; verbs succeed unless
//! scripted to fail, optionally after a scripted delay.

use super::{
    ActionOutcome, Actuators, ApiClient, BrowserLauncher, BrowserSession, FileSystem, OsAutomation,
    ShellOptions, ShellRunner, WindowOp,
};
use crate::plan::{ApiCallParams, MouseButton};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub verb: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct MockLog {
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockLog {
    pub fn record(&self, verb: &str, target: &str) {
        guard(&self.calls).push(MockCall {
            verb: verb.to_string(),
            target: target.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<MockCall> {
        guard(&self.calls).clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        guard(&self.calls).iter().filter(|c| c.verb == verb).count()
    }

    pub fn verbs(&self) -> Vec<String> {
        guard(&self.calls).iter().map(|c| c.verb.clone()).collect()
    }

    pub fn targets(&self, verb: &str) -> Vec<String> {
        guard(&self.calls)
            .iter()
            .filter(|c| c.verb == verb)
            .map(|c| c.target.clone())
            .collect()
    }
}

#[derive(Default)]
struct Script {
    /// (verb, target); a `None` target fails every call of the verb.
    failures: Vec<(String, Option<String>)>,
    delays: HashMap<String, Duration>,
    outputs: HashMap<String, String>,
}

/// One object standing in for every non-browser actuator.
pub struct MockActuator {
    log: MockLog,
    script: Mutex<Script>,
}

impl MockActuator {
    pub fn new(log: MockLog) -> Self {
        Self {
            log,
            script: Mutex::new(Script::default()),
        }
    }

    async fn respond(&self, verb: &str, target: &str) -> ActionOutcome {
        self.log.record(verb, target);
        let (delay, fails, output) = {
            let script = guard(&self.script);
            let fails = script
                .failures
                .iter()
                .any(|(v, t)| v == verb && t.as_deref().map_or(true, |t| t == target));
            (
                script.delays.get(verb).copied(),
                fails,
                script.outputs.get(verb).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return ActionOutcome::failed(format!("{} {} failed", verb, target));
        }
        ActionOutcome::ok(output.unwrap_or_else(|| format!("{} {}", verb, target)))
    }
}

#[async_trait]
impl ShellRunner for MockActuator {
    async fn execute(&self, command: &str, _options: &ShellOptions) -> ActionOutcome {
        self.respond("shell", command).await
    }
}

#[async_trait]
impl FileSystem for MockActuator {
    async fn read(&self, path: &str) -> ActionOutcome {
        self.respond("file_read", path).await
    }

    async fn write(&self, path: &str, _content: &str, _append: bool) -> ActionOutcome {
        self.respond("file_write", path).await
    }

    async fn move_path(&self, from: &str, to: &str) -> ActionOutcome {
        self.respond("file_move", &format!("{} -> {}", from, to)).await
    }

    async fn copy(&self, from: &str, to: &str) -> ActionOutcome {
        self.respond("file_copy", &format!("{} -> {}", from, to)).await
    }

    async fn delete(&self, path: &str) -> ActionOutcome {
        self.respond("file_delete", path).await
    }

    async fn create_dir(&self, path: &str) -> ActionOutcome {
        self.respond("folder_create", path).await
    }

    async fn remove_dir(&self, path: &str, _recursive: bool) -> ActionOutcome {
        self.respond("folder_delete", path).await
    }
}

#[async_trait]
impl OsAutomation for MockActuator {
    async fn open_url(&self, url: &str) -> ActionOutcome {
        self.respond("url_open", url).await
    }

    async fn open_app(&self, name: &str, _args: &[String]) -> ActionOutcome {
        self.respond("app_open", name).await
    }

    async fn close_app(&self, name: &str) -> ActionOutcome {
        self.respond("app_close", name).await
    }

    async fn focus_app(&self, name: &str) -> ActionOutcome {
        self.respond("app_focus", name).await
    }

    async fn clipboard_read(&self) -> ActionOutcome {
        self.respond("clipboard_read", "").await
    }

    async fn clipboard_write(&self, text: &str) -> ActionOutcome {
        self.respond("clipboard_write", text).await
    }

    async fn notify(&self, title: &str, _body: &str) -> ActionOutcome {
        self.respond("notification", title).await
    }

    async fn click(&self, x: i32, y: i32, _button: MouseButton, double: bool) -> ActionOutcome {
        let verb = if double { "gui_double_click" } else { "gui_click" };
        self.respond(verb, &format!("{},{}", x, y)).await
    }

    async fn type_text(&self, text: &str) -> ActionOutcome {
        self.respond("gui_type", text).await
    }

    async fn hotkey(&self, keys: &[String]) -> ActionOutcome {
        self.respond("gui_hotkey", &keys.join("+")).await
    }

    async fn scroll(&self, dx: i32, dy: i32) -> ActionOutcome {
        self.respond("gui_scroll", &format!("{},{}", dx, dy)).await
    }

    async fn window(&self, op: WindowOp, title: &str) -> ActionOutcome {
        let verb = match op {
            WindowOp::Focus => "window_focus",
            WindowOp::Minimize => "window_minimize",
            WindowOp::Maximize => "window_maximize",
            WindowOp::Close => "window_close",
        };
        self.respond(verb, title).await
    }
}

#[async_trait]
impl ApiClient for MockActuator {
    async fn call(&self, request: &ApiCallParams, _cancel: &CancellationToken) -> ActionOutcome {
        self.respond("api_call", &request.url).await
    }
}

pub struct MockBrowserSession {
    actuator: Arc<MockActuator>,
}

#[async_trait]
impl BrowserSession for MockBrowserSession {
    async fn navigate(&self, url: &str) -> ActionOutcome {
        self.actuator.respond("browser_navigate", url).await
    }

    async fn click(&self, selector: &str) -> ActionOutcome {
        self.actuator.respond("browser_click", selector).await
    }

    async fn type_text(&self, selector: &str, _text: &str) -> ActionOutcome {
        self.actuator.respond("browser_type", selector).await
    }

    async fn select(&self, selector: &str, _value: &str) -> ActionOutcome {
        self.actuator.respond("browser_select", selector).await
    }

    async fn hover(&self, selector: &str) -> ActionOutcome {
        self.actuator.respond("browser_hover", selector).await
    }

    async fn scroll(&self, dx: i32, dy: i32) -> ActionOutcome {
        self.actuator
            .respond("browser_scroll", &format!("{},{}", dx, dy))
            .await
    }

    async fn wait_for(&self, selector: &str, _timeout_ms: u64) -> ActionOutcome {
        self.actuator.respond("browser_wait", selector).await
    }

    async fn extract(&self, selector: &str) -> ActionOutcome {
        self.actuator.respond("browser_extract", selector).await
    }

    async fn screenshot(&self, path: Option<&str>) -> ActionOutcome {
        self.actuator
            .respond("browser_screenshot", path.unwrap_or(""))
            .await
    }

    async fn evaluate(&self, script: &str) -> ActionOutcome {
        self.actuator.respond("browser_evaluate", script).await
    }

    async fn back(&self) -> ActionOutcome {
        self.actuator.respond("browser_back", "").await
    }

    async fn shutdown(&self) {
        self.actuator.log.record("browser_shutdown", "");
    }
}

pub struct MockBrowserLauncher {
    actuator: Arc<MockActuator>,
    launches: AtomicUsize,
}

impl MockBrowserLauncher {
    pub fn new(log: MockLog) -> Self {
        Self::sharing(Arc::new(MockActuator::new(log)))
    }

    fn sharing(actuator: Arc<MockActuator>) -> Self {
        Self {
            actuator,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for MockBrowserLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, String> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBrowserSession {
            actuator: Arc::clone(&self.actuator),
        }))
    }
}

/// A full recording actuator set sharing one log and one script.
pub struct MockActuators {
    pub log: MockLog,
    actuator: Arc<MockActuator>,
    launcher: Arc<MockBrowserLauncher>,
}

impl Default for MockActuators {
    fn default() -> Self {
        Self::new()
    }
}

impl MockActuators {
    pub fn new() -> Self {
        let log = MockLog::default();
        let actuator = Arc::new(MockActuator::new(log.clone()));
        let launcher = Arc::new(MockBrowserLauncher::sharing(Arc::clone(&actuator)));
        Self {
            log,
            actuator,
            launcher,
        }
    }

    pub fn actuators(&self) -> Actuators {
        Actuators::new(
            self.actuator.clone(),
            self.actuator.clone(),
            self.actuator.clone(),
            self.actuator.clone(),
            self.launcher.clone(),
        )
    }

    /// Every call of `verb` fails.
    pub fn fail(&self, verb: &str) {
        guard(&self.actuator.script)
            .failures
            .push((verb.to_string(), None));
    }

    /// Calls of `verb` against exactly `target` fail.
    pub fn fail_on(&self, verb: &str, target: &str) {
        guard(&self.actuator.script)
            .failures
            .push((verb.to_string(), Some(target.to_string())));
    }

    pub fn delay(&self, verb: &str, delay: Duration) {
        guard(&self.actuator.script)
            .delays
            .insert(verb.to_string(), delay);
    }

    pub fn respond_with(&self, verb: &str, output: &str) {
        guard(&self.actuator.script)
            .outputs
            .insert(verb.to_string(), output.to_string());
    }

    pub fn browser_launches(&self) -> usize {
        self.launcher.launches()
    }
}
