//! Adapters that perform real side effects.
//!
//! Each adapter is opaque to the engine: one async method per verb, every
//! call normalized to an `ActionOutcome`. Adapters never return `Err`; a
//! failed call is an outcome with `success == false`.

pub mod browser;
pub mod file;
pub mod http;
pub mod mock;
pub mod os;
pub mod shell;

use crate::plan::{ApiCallParams, MouseButton};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use browser::{BrowserHandle, BrowserLauncher, BrowserSession, UnconfiguredBrowserLauncher};
pub use file::LocalFileSystem;
pub use http::ReqwestApiClient;
pub use os::SystemOsBridge;
pub use shell::TokioShellRunner;

/// Uniform result of any actuator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            output: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Stamps the elapsed time since `started` unless the adapter already did.
    pub fn timed_from(self, started: Instant) -> Self {
        if self.duration_ms > 0 {
            return self;
        }
        self.with_duration(started.elapsed())
    }
}

/// Failure outcome for a verb the host adapter has no primitive for.
pub fn unsupported(verb: &str) -> ActionOutcome {
    ActionOutcome::failed(format!("{} is not supported on this host", verb))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOptions {
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn execute(&self, command: &str, options: &ShellOptions) -> ActionOutcome;
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &str) -> ActionOutcome;
    async fn write(&self, path: &str, content: &str, append: bool) -> ActionOutcome;
    async fn move_path(&self, from: &str, to: &str) -> ActionOutcome;
    async fn copy(&self, from: &str, to: &str) -> ActionOutcome;
    async fn delete(&self, path: &str) -> ActionOutcome;
    async fn create_dir(&self, path: &str) -> ActionOutcome;
    async fn remove_dir(&self, path: &str, recursive: bool) -> ActionOutcome;
}

/// OS-level application, window, clipboard, notification and GUI control.
#[async_trait]
pub trait OsAutomation: Send + Sync {
    async fn open_url(&self, url: &str) -> ActionOutcome;
    async fn open_app(&self, name: &str, args: &[String]) -> ActionOutcome;
    async fn close_app(&self, name: &str) -> ActionOutcome;
    async fn focus_app(&self, name: &str) -> ActionOutcome;
    async fn clipboard_read(&self) -> ActionOutcome;
    async fn clipboard_write(&self, text: &str) -> ActionOutcome;
    async fn notify(&self, title: &str, body: &str) -> ActionOutcome;
    async fn click(&self, x: i32, y: i32, button: MouseButton, double: bool) -> ActionOutcome;
    async fn type_text(&self, text: &str) -> ActionOutcome;
    async fn hotkey(&self, keys: &[String]) -> ActionOutcome;
    async fn scroll(&self, dx: i32, dy: i32) -> ActionOutcome;
    async fn window(&self, op: WindowOp, title: &str) -> ActionOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOp {
    Focus,
    Minimize,
    Maximize,
    Close,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Retries stop once `cancel` fires.
    async fn call(&self, request: &ApiCallParams, cancel: &CancellationToken) -> ActionOutcome;
}

/// The actuators one engine instance owns.
#[derive(Clone)]
pub struct Actuators {
    pub shell: Arc<dyn ShellRunner>,
    pub files: Arc<dyn FileSystem>,
    pub os: Arc<dyn OsAutomation>,
    pub api: Arc<dyn ApiClient>,
    pub browser: Arc<BrowserHandle>,
}

impl Actuators {
    pub fn new(
        shell: Arc<dyn ShellRunner>,
        files: Arc<dyn FileSystem>,
        os: Arc<dyn OsAutomation>,
        api: Arc<dyn ApiClient>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            shell,
            files,
            os,
            api,
            browser: Arc::new(BrowserHandle::new(browser)),
        }
    }

    /// Host adapters configured from `config`, with no browser driver.
    pub fn system(config: &crate::config::EngineConfig) -> Self {
        Self::new(
            Arc::new(TokioShellRunner::new(&config.shell)),
            Arc::new(LocalFileSystem),
            Arc::new(SystemOsBridge),
            Arc::new(ReqwestApiClient::new(&config.http)),
            Arc::new(UnconfiguredBrowserLauncher),
        )
    }

    /// Releases sessions held by stateful adapters.
    pub async fn close(&self) {
        self.browser.close().await;
    }
}
