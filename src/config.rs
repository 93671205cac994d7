//! Engine configuration.
//!
//! Stored as JSON, by default at `<config_dir>/desktop-orchestrator/config.json`.
//! Every field has a default, so a partial file is valid.

use crate::backoff::BackoffConfig;
use crate::permission::PermissionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellConfig {
    #[serde(default = "default_shell_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
}

fn default_shell_timeout_ms() -> u64 {
    60_000
}

fn default_blocked_commands() -> Vec<String> {
    [
        "rm -rf /",
        "rm -rf ~",
        "mkfs",
        "dd if=/dev/zero",
        ":(){ :|:& };:",
        "shutdown",
        "reboot",
        "format c:",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shell_timeout_ms(),
            blocked_commands: default_blocked_commands(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackConfig {
    #[serde(default = "default_feedback_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_feedback_backoff")]
    pub backoff: BackoffConfig,
}

fn default_feedback_attempts() -> u32 {
    3
}

fn default_feedback_backoff() -> BackoffConfig {
    BackoffConfig::new(500, 4_000, 2.0)
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_feedback_attempts(),
            backoff: default_feedback_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    /// Pause between consecutive steps of one plan.
    #[serde(default)]
    pub step_delay_ms: u64,
    #[serde(default = "default_true")]
    pub require_confirmation_for_high_risk: bool,
    #[serde(default = "default_true")]
    pub enable_feedback_loop: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub permissions: PermissionPolicy,
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_rollback: true,
            step_delay_ms: 0,
            require_confirmation_for_high_risk: true,
            enable_feedback_loop: true,
            event_capacity: default_event_capacity(),
            shell: ShellConfig::default(),
            http: HttpConfig::default(),
            feedback: FeedbackConfig::default(),
            permissions: PermissionPolicy::default(),
        }
    }
}

/// Default config file location, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("desktop-orchestrator").join("config.json"))
}

/// Loads an explicitly named config file. Missing or malformed is an error.
pub fn load_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the config at the default location, falling back to defaults when
/// the file is absent or unreadable.
pub fn load_default_config() -> EngineConfig {
    let Some(path) = default_config_path() else {
        return EngineConfig::default();
    };
    if !path.exists() {
        return EngineConfig::default();
    }
    match load_config_from(&path) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("{}; using default configuration", err);
            EngineConfig::default()
        }
    }
}
