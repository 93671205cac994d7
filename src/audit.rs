//! Append-only record of authorization decisions and execution outcomes.
//!
//! Logging is fire-and-forget: sinks swallow their own failures so that an
//! audit problem never fails the action being audited.

use crate::actuator::ActionOutcome;
use crate::permission::PermissionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    PermissionDenied,
    ActionExecuted,
    ActionFailed,
    RollbackExecuted,
    RollbackFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventKind,
    pub action: String,
    pub decision: AuditDecision,
    pub context: PermissionContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,
    /// Raw error text from the gate or the actuator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(event: AuditEventKind, decision: AuditDecision, context: PermissionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
            action: context.action_type.clone(),
            decision,
            context,
            outcome: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: &ActionOutcome) -> Self {
        if self.error.is_none() {
            self.error = outcome.error.clone();
        }
        self.outcome = Some(outcome.clone());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub trait AuditLogger: Send + Sync {
    fn log(&self, entry: AuditEntry);
}

/// In-process audit trail.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn entries_for(&self, plan_id: &str) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.context.plan_id == plan_id)
            .collect()
    }
}

impl AuditLogger for MemoryAuditLog {
    fn log(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &AuditEntry) -> Result<(), String> {
        let line = serde_json::to_string(entry).map_err(|e| format!("serialize failed: {}", e))?;
        let _guard = self.write_lock.lock().map_err(|_| "audit lock poisoned".to_string())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("create directory failed: {}", e))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("open failed: {}", e))?;
        writeln!(file, "{}", line).map_err(|e| format!("write failed: {}", e))
    }
}

impl AuditLogger for JsonlAuditLog {
    fn log(&self, entry: AuditEntry) {
        if let Err(err) = self.append(&entry) {
            log::warn!(
                "failed to write audit entry to {}: {}",
                self.path.display(),
                err
            );
        }
    }
}
