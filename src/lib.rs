pub mod actuator;
pub mod audit;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod feedback;
pub mod permission;
pub mod plan;

pub use actuator::{ActionOutcome, Actuators};
pub use audit::{AuditEntry, AuditLogger, JsonlAuditLog, MemoryAuditLog};
pub use config::EngineConfig;
pub use engine::{ExecutionStatus, PauseReason, PlanExecution, PlanExecutionEngine};
pub use errors::{AppError, EngineError, ErrorKind};
pub use events::ExecutionEvent;
pub use permission::{AllowAllGate, PermissionGate, PermissionPolicy, PolicyPermissionGate};
pub use plan::{ExecutionPlan, PlanStep, StepAction};
