use super::ActionOutcome;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One live browser-automation session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> ActionOutcome;
    async fn click(&self, selector: &str) -> ActionOutcome;
    async fn type_text(&self, selector: &str, text: &str) -> ActionOutcome;
    async fn select(&self, selector: &str, value: &str) -> ActionOutcome;
    async fn hover(&self, selector: &str) -> ActionOutcome;
    async fn scroll(&self, dx: i32, dy: i32) -> ActionOutcome;
    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> ActionOutcome;
    async fn extract(&self, selector: &str) -> ActionOutcome;
    async fn screenshot(&self, path: Option<&str>) -> ActionOutcome;
    async fn evaluate(&self, script: &str) -> ActionOutcome;
    async fn back(&self) -> ActionOutcome;
    async fn shutdown(&self);
}

/// Builds sessions on demand.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, String>;
}

/// Launcher used when no browser driver is wired in.
pub struct UnconfiguredBrowserLauncher;

#[async_trait]
impl BrowserLauncher for UnconfiguredBrowserLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, String> {
        Err("no browser automation driver is configured".to_string())
    }
}

/// Lazily-built browser session owned by one engine.
pub struct BrowserHandle {
    launcher: Arc<dyn BrowserLauncher>,
    session: Mutex<Option<Arc<dyn BrowserSession>>>,
}

impl BrowserHandle {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            session: Mutex::new(None),
        }
    }

    /// Returns the live session, launching it on first use.
    pub async fn session(&self) -> Result<Arc<dyn BrowserSession>, String> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }
        log::info!("launching browser automation session");
        let session = self.launcher.launch().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Shuts the session down if one is open. Safe to call repeatedly.
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            log::info!("closing browser automation session");
            session.shutdown().await;
        }
    }
}
