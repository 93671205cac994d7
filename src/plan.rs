use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PLAN_VERSION: u32 = 1;

/// Ordered steps produced upstream by the planner. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    #[serde(default = "default_plan_version")]
    pub version: u32,
    #[serde(default)]
    pub title: String,
    pub steps: Vec<PlanStep>,
}

fn default_plan_version() -> u32 {
    PLAN_VERSION
}

impl ExecutionPlan {
    pub fn new(id: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: id.into(),
            version: PLAN_VERSION,
            title: String::new(),
            steps,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Post-condition the feedback loop re-checks after acting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedState {
    pub description: String,
    #[serde(default)]
    pub checks: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub action: StepAction,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Box<PlanStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<ExpectedState>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            action,
            risk_level: RiskLevel::Low,
            reversible: false,
            rollback: None,
            expected_state: None,
        }
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Marks the step reversible and attaches its compensating step.
    pub fn with_rollback(mut self, rollback: PlanStep) -> Self {
        self.reversible = true;
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn with_expected_state(mut self, expected: ExpectedState) -> Self {
        self.expected_state = Some(expected);
        self
    }

    /// Whether rollback may compensate this step once it has succeeded.
    pub fn is_compensable(&self) -> bool {
        self.reversible && self.rollback.is_some()
    }
}

/// Coarse permission category of an action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Shell,
    File,
    Folder,
    Url,
    App,
    Clipboard,
    Notification,
    Browser,
    Gui,
    Window,
    Api,
    UserInput,
    Wait,
    Condition,
    Loop,
}

impl ActionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCategory::Shell => "shell",
            ActionCategory::File => "file",
            ActionCategory::Folder => "folder",
            ActionCategory::Url => "url",
            ActionCategory::App => "app",
            ActionCategory::Clipboard => "clipboard",
            ActionCategory::Notification => "notification",
            ActionCategory::Browser => "browser",
            ActionCategory::Gui => "gui",
            ActionCategory::Window => "window",
            ActionCategory::Api => "api",
            ActionCategory::UserInput => "user_input",
            ActionCategory::Wait => "wait",
            ActionCategory::Condition => "condition",
            ActionCategory::Loop => "loop",
        }
    }

    /// Categories whose steps can be verified by the feedback loop.
    pub fn supports_feedback(&self) -> bool {
        matches!(
            self,
            ActionCategory::Browser | ActionCategory::App | ActionCategory::Gui | ActionCategory::Window
        )
    }
}

impl std::fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown action category: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteParams {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderDeleteParams {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlParams {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextParams {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationParams {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorParams {
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserTypeParams {
    pub selector: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserSelectParams {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserWaitParams {
    pub selector: String,
    #[serde(default = "default_browser_wait_ms")]
    pub timeout_ms: u64,
}

fn default_browser_wait_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptParams {
    pub script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollParams {
    #[serde(default)]
    pub dx: i32,
    #[serde(default)]
    pub dy: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointParams {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub button: MouseButton,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotkeyParams {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowParams {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallParams {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitParams {
    pub duration_ms: u64,
}

/// Payload of `condition`/`loop` steps. Carried through but never evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

/// Every action the engine can dispatch, each with its own parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum StepAction {
    Shell(ShellParams),
    FileRead(PathParams),
    FileWrite(FileWriteParams),
    FileMove(TransferParams),
    FileCopy(TransferParams),
    FileDelete(PathParams),
    FolderCreate(PathParams),
    FolderDelete(FolderDeleteParams),
    UrlOpen(UrlParams),
    AppOpen(AppParams),
    AppClose(AppParams),
    AppFocus(AppParams),
    ClipboardRead,
    ClipboardWrite(TextParams),
    Notification(NotificationParams),
    BrowserNavigate(UrlParams),
    BrowserClick(SelectorParams),
    BrowserType(BrowserTypeParams),
    BrowserSelect(BrowserSelectParams),
    BrowserHover(SelectorParams),
    BrowserScroll(ScrollParams),
    BrowserWait(BrowserWaitParams),
    BrowserExtract(SelectorParams),
    BrowserScreenshot(ScreenshotParams),
    BrowserEvaluate(ScriptParams),
    BrowserBack,
    BrowserClose,
    GuiClick(PointParams),
    GuiDoubleClick(PointParams),
    GuiType(TextParams),
    GuiHotkey(HotkeyParams),
    GuiScroll(ScrollParams),
    WindowFocus(WindowParams),
    WindowMinimize(WindowParams),
    WindowMaximize(WindowParams),
    WindowClose(WindowParams),
    ApiCall(ApiCallParams),
    UserInput(UserInputParams),
    Wait(WaitParams),
    Condition(PlaceholderParams),
    Loop(PlaceholderParams),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Shell(_) => "shell",
            StepAction::FileRead(_) => "file_read",
            StepAction::FileWrite(_) => "file_write",
            StepAction::FileMove(_) => "file_move",
            StepAction::FileCopy(_) => "file_copy",
            StepAction::FileDelete(_) => "file_delete",
            StepAction::FolderCreate(_) => "folder_create",
            StepAction::FolderDelete(_) => "folder_delete",
            StepAction::UrlOpen(_) => "url_open",
            StepAction::AppOpen(_) => "app_open",
            StepAction::AppClose(_) => "app_close",
            StepAction::AppFocus(_) => "app_focus",
            StepAction::ClipboardRead => "clipboard_read",
            StepAction::ClipboardWrite(_) => "clipboard_write",
            StepAction::Notification(_) => "notification",
            StepAction::BrowserNavigate(_) => "browser_navigate",
            StepAction::BrowserClick(_) => "browser_click",
            StepAction::BrowserType(_) => "browser_type",
            StepAction::BrowserSelect(_) => "browser_select",
            StepAction::BrowserHover(_) => "browser_hover",
            StepAction::BrowserScroll(_) => "browser_scroll",
            StepAction::BrowserWait(_) => "browser_wait",
            StepAction::BrowserExtract(_) => "browser_extract",
            StepAction::BrowserScreenshot(_) => "browser_screenshot",
            StepAction::BrowserEvaluate(_) => "browser_evaluate",
            StepAction::BrowserBack => "browser_back",
            StepAction::BrowserClose => "browser_close",
            StepAction::GuiClick(_) => "gui_click",
            StepAction::GuiDoubleClick(_) => "gui_double_click",
            StepAction::GuiType(_) => "gui_type",
            StepAction::GuiHotkey(_) => "gui_hotkey",
            StepAction::GuiScroll(_) => "gui_scroll",
            StepAction::WindowFocus(_) => "window_focus",
            StepAction::WindowMinimize(_) => "window_minimize",
            StepAction::WindowMaximize(_) => "window_maximize",
            StepAction::WindowClose(_) => "window_close",
            StepAction::ApiCall(_) => "api_call",
            StepAction::UserInput(_) => "user_input",
            StepAction::Wait(_) => "wait",
            StepAction::Condition(_) => "condition",
            StepAction::Loop(_) => "loop",
        }
    }

    pub fn category(&self) -> ActionCategory {
        match self {
            StepAction::Shell(_) => ActionCategory::Shell,
            StepAction::FileRead(_)
            | StepAction::FileWrite(_)
            | StepAction::FileMove(_)
            | StepAction::FileCopy(_)
            | StepAction::FileDelete(_) => ActionCategory::File,
            StepAction::FolderCreate(_) | StepAction::FolderDelete(_) => ActionCategory::Folder,
            StepAction::UrlOpen(_) => ActionCategory::Url,
            StepAction::AppOpen(_) | StepAction::AppClose(_) | StepAction::AppFocus(_) => {
                ActionCategory::App
            }
            StepAction::ClipboardRead | StepAction::ClipboardWrite(_) => ActionCategory::Clipboard,
            StepAction::Notification(_) => ActionCategory::Notification,
            StepAction::BrowserNavigate(_)
            | StepAction::BrowserClick(_)
            | StepAction::BrowserType(_)
            | StepAction::BrowserSelect(_)
            | StepAction::BrowserHover(_)
            | StepAction::BrowserScroll(_)
            | StepAction::BrowserWait(_)
            | StepAction::BrowserExtract(_)
            | StepAction::BrowserScreenshot(_)
            | StepAction::BrowserEvaluate(_)
            | StepAction::BrowserBack
            | StepAction::BrowserClose => ActionCategory::Browser,
            StepAction::GuiClick(_)
            | StepAction::GuiDoubleClick(_)
            | StepAction::GuiType(_)
            | StepAction::GuiHotkey(_)
            | StepAction::GuiScroll(_) => ActionCategory::Gui,
            StepAction::WindowFocus(_)
            | StepAction::WindowMinimize(_)
            | StepAction::WindowMaximize(_)
            | StepAction::WindowClose(_) => ActionCategory::Window,
            StepAction::ApiCall(_) => ActionCategory::Api,
            StepAction::UserInput(_) => ActionCategory::UserInput,
            StepAction::Wait(_) => ActionCategory::Wait,
            StepAction::Condition(_) => ActionCategory::Condition,
            StepAction::Loop(_) => ActionCategory::Loop,
        }
    }

    /// The `params` half of the wire form, for permission contexts and audit.
    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut value| value.get_mut("params").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }

    /// Rejects parameter records no actuator could act on.
    pub fn validate(&self, step_id: &str) -> Result<(), EngineError> {
        let malformed = |reason: &str| {
            Err(EngineError::MalformedStep {
                step_id: step_id.to_string(),
                reason: reason.to_string(),
            })
        };

        match self {
            StepAction::Shell(p) if p.command.trim().is_empty() => malformed("empty shell command"),
            StepAction::FileRead(p)
            | StepAction::FileDelete(p)
            | StepAction::FolderCreate(p)
                if p.path.trim().is_empty() =>
            {
                malformed("empty path")
            }
            StepAction::FileWrite(p) if p.path.trim().is_empty() => malformed("empty path"),
            StepAction::FolderDelete(p) if p.path.trim().is_empty() => malformed("empty path"),
            StepAction::FileMove(p) | StepAction::FileCopy(p)
                if p.from.trim().is_empty() || p.to.trim().is_empty() =>
            {
                malformed("empty source or destination path")
            }
            StepAction::UrlOpen(p) | StepAction::BrowserNavigate(p) if p.url.trim().is_empty() => {
                malformed("empty url")
            }
            StepAction::AppOpen(p) | StepAction::AppClose(p) | StepAction::AppFocus(p)
                if p.name.trim().is_empty() =>
            {
                malformed("empty application name")
            }
            StepAction::BrowserClick(p)
            | StepAction::BrowserHover(p)
            | StepAction::BrowserExtract(p)
                if p.selector.trim().is_empty() =>
            {
                malformed("empty selector")
            }
            StepAction::BrowserType(p) if p.selector.trim().is_empty() => malformed("empty selector"),
            StepAction::BrowserSelect(p) if p.selector.trim().is_empty() => {
                malformed("empty selector")
            }
            StepAction::BrowserWait(p) if p.selector.trim().is_empty() => malformed("empty selector"),
            StepAction::BrowserEvaluate(p) if p.script.trim().is_empty() => malformed("empty script"),
            StepAction::GuiHotkey(p) if p.keys.is_empty() => malformed("no keys in hotkey"),
            StepAction::WindowFocus(p)
            | StepAction::WindowMinimize(p)
            | StepAction::WindowMaximize(p)
            | StepAction::WindowClose(p)
                if p.title.trim().is_empty() =>
            {
                malformed("empty window title")
            }
            StepAction::ApiCall(p) if p.url.trim().is_empty() => malformed("empty url"),
            StepAction::ApiCall(p) if reqwest::Method::from_bytes(p.method.as_bytes()).is_err() => {
                malformed("invalid http method")
            }
            StepAction::Notification(p) if p.title.trim().is_empty() => {
                malformed("empty notification title")
            }
            _ => Ok(()),
        }
    }
}
