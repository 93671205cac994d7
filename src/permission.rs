//! Authorization of action requests before any side effect.

use crate::plan::{ActionCategory, PlanStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    System,
    User,
}

/// Everything a gate may consider when deciding on one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionContext {
    pub action_type: String,
    pub category: ActionCategory,
    pub params: serde_json::Value,
    pub source: RequestSource,
    pub timestamp: DateTime<Utc>,
    pub plan_id: String,
    pub step_id: String,
}

impl PermissionContext {
    pub fn for_step(plan_id: &str, step: &PlanStep) -> Self {
        Self {
            action_type: step.action.kind().to_string(),
            category: step.action.category(),
            params: step.action.params_json(),
            source: RequestSource::System,
            timestamp: Utc::now(),
            plan_id: plan_id.to_string(),
            step_id: step.id.clone(),
        }
    }

    fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check_permission(&self, context: &PermissionContext) -> PermissionDecision;
}

/// Approves everything. For trusted runs and tests.
pub struct AllowAllGate;

#[async_trait]
impl PermissionGate for AllowAllGate {
    async fn check_permission(&self, _context: &PermissionContext) -> PermissionDecision {
        PermissionDecision::allow()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPolicy {
    #[serde(default)]
    pub denied_categories: Vec<ActionCategory>,
    /// When set, only these categories may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_categories: Option<Vec<ActionCategory>>,
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
    #[serde(default = "default_url_schemes")]
    pub allowed_url_schemes: Vec<String>,
    #[serde(default)]
    pub blocked_command_patterns: Vec<String>,
}

fn default_protected_paths() -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        vec![
            "C:\\Windows".to_string(),
            "C:\\Program Files".to_string(),
        ]
    }

    #[cfg(not(target_os = "windows"))]
    {
        ["/etc", "/bin", "/sbin", "/usr", "/System", "/boot"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

fn default_url_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string(), "mailto".to_string()]
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            denied_categories: Vec::new(),
            allowed_categories: None,
            protected_paths: default_protected_paths(),
            allowed_url_schemes: default_url_schemes(),
            blocked_command_patterns: Vec::new(),
        }
    }
}

impl PermissionPolicy {
    pub fn deny_category(mut self, category: ActionCategory) -> Self {
        if !self.denied_categories.contains(&category) {
            self.denied_categories.push(category);
        }
        self
    }

    pub fn evaluate(&self, context: &PermissionContext) -> PermissionDecision {
        let category = context.category;

        if self.denied_categories.contains(&category) {
            return PermissionDecision::deny(format!(
                "category '{}' is denied by policy",
                category
            ));
        }
        if let Some(allowed) = &self.allowed_categories {
            if !allowed.contains(&category) {
                return PermissionDecision::deny(format!(
                    "category '{}' is not in the allowed list",
                    category
                ));
            }
        }

        match category {
            ActionCategory::File | ActionCategory::Folder => {
                for key in ["path", "from", "to"] {
                    let Some(path) = context.param_str(key) else {
                        continue;
                    };
                    if self.protected_paths.is_empty() {
                        continue;
                    }
                    let Some(resolved) = normalize_path(Path::new(path)) else {
                        return PermissionDecision::deny(format!(
                            "path {} cannot be resolved against the working directory",
                            path
                        ));
                    };
                    if let Some(prefix) = self.protected_prefix(&resolved) {
                        return PermissionDecision::deny(format!(
                            "path {} is under protected location {}",
                            path, prefix
                        ));
                    }
                }
            }
            ActionCategory::Url | ActionCategory::Browser | ActionCategory::Api => {
                if let Some(url) = context.param_str("url") {
                    let scheme = url_scheme(url);
                    if !self
                        .allowed_url_schemes
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(&scheme))
                    {
                        return PermissionDecision::deny(format!(
                            "url scheme '{}' is not allowed",
                            scheme
                        ));
                    }
                }
            }
            ActionCategory::Shell => {
                if let Some(command) = context.param_str("command") {
                    if let Some(pattern) = self
                        .blocked_command_patterns
                        .iter()
                        .find(|pattern| command.contains(pattern.as_str()))
                    {
                        return PermissionDecision::deny(format!(
                            "command matches blocked pattern '{}'",
                            pattern
                        ));
                    }
                }
            }
            _ => {}
        }

        PermissionDecision::allow()
    }

    fn protected_prefix(&self, path: &Path) -> Option<&str> {
        self.protected_paths
            .iter()
            .find(|prefix| {
                normalize_path(Path::new(prefix.as_str()))
                    .is_some_and(|prefix| path.starts_with(prefix))
            })
            .map(|prefix| prefix.as_str())
    }
}

/// Lexically resolves `.` and `..` and anchors relative paths at the
/// current directory. `..` at the root stays at the root. Symlinks are
/// not followed. `None` when the current directory is unavailable.
fn normalize_path(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(resolved.components().next_back(), Some(Component::Normal(_))) {
                    resolved.pop();
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Some(resolved)
}

fn url_scheme(url: &str) -> String {
    url.split_once(':')
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Gate backed by a replaceable `PermissionPolicy`.
pub struct PolicyPermissionGate {
    policy: RwLock<PermissionPolicy>,
}

impl PolicyPermissionGate {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Swaps the policy. Takes effect for the next decision, including
    /// compensating steps of a rollback already under way.
    pub async fn set_policy(&self, policy: PermissionPolicy) {
        *self.policy.write().await = policy;
    }

    pub async fn policy(&self) -> PermissionPolicy {
        self.policy.read().await.clone()
    }
}

#[async_trait]
impl PermissionGate for PolicyPermissionGate {
    async fn check_permission(&self, context: &PermissionContext) -> PermissionDecision {
        let decision = self.policy.read().await.evaluate(context);
        if !decision.allowed {
            log::warn!(
                "permission denied for {} ({}): {}",
                context.action_type,
                context.step_id,
                decision.reason.as_deref().unwrap_or("no reason given")
            );
        }
        decision
    }
}
