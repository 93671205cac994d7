use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ActuatorError,
    RollbackError,
    EngineFault,
}

/// Error recorded on a `PlanExecution`. Failures are data at the engine
/// boundary, so this is serializable and carries enough to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AppError {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PermissionDenied,
            message: message.into(),
            details: None,
            code: Some("permission_denied".to_string()),
        }
    }

    pub fn actuator(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            kind: ErrorKind::ActuatorError,
            message: message.into(),
            details,
            code: Some("actuator_error".to_string()),
        }
    }

    /// Compensating steps that failed during a rollback sweep.
    pub fn rollback(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            kind: ErrorKind::RollbackError,
            message: message.into(),
            details,
            code: Some("rollback_error".to_string()),
        }
    }

    pub fn engine_fault(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::EngineFault,
            message: message.into(),
            details: None,
            code: Some("engine_fault".to_string()),
        }
    }
}

/// Faults raised inside the engine itself, as opposed to failed actions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed step {step_id}: {reason}")]
    MalformedStep { step_id: String, reason: String },

    #[error("engine is closed")]
    Closed,

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::MalformedStep { step_id, reason } => Self {
                kind: ErrorKind::EngineFault,
                message: format!("malformed step {}: {}", step_id, reason),
                details: Some(reason),
                code: Some("malformed_step".to_string()),
            },
            EngineError::Closed => Self {
                kind: ErrorKind::EngineFault,
                message: "engine is closed".to_string(),
                details: None,
                code: Some("engine_closed".to_string()),
            },
            EngineError::ExecutionNotFound(plan_id) => Self {
                kind: ErrorKind::EngineFault,
                message: format!("execution not found: {}", plan_id),
                details: None,
                code: Some("execution_not_found".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_engine_error_to_fault_kind() {
        let e: AppError = EngineError::MalformedStep {
            step_id: "s1".to_string(),
            reason: "empty command".to_string(),
        }
        .into();
        assert_eq!(e.kind, ErrorKind::EngineFault);
        assert_eq!(e.code.as_deref(), Some("malformed_step"));
        assert!(e.message.contains("s1"));

        let e: AppError = EngineError::Closed.into();
        assert_eq!(e.code.as_deref(), Some("engine_closed"));
    }

    #[test]
    fn rollback_error_keeps_details() {
        let e = AppError::rollback("1 of 2 compensating step(s) failed", Some("b-undo".into()));
        assert_eq!(e.kind, ErrorKind::RollbackError);
        assert_eq!(e.code.as_deref(), Some("rollback_error"));
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["kind"], "rollback_error");
        assert_eq!(json["details"], "b-undo");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let e = AppError::permission_denied("nope");
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["kind"], "permission_denied");
        assert!(json.get("details").is_none());
    }
}
