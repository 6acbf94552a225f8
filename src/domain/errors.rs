//! Error taxonomy shared by the service layer.

use thiserror::Error;
use uuid::Uuid;

use super::ports::worker::WorkerError;

/// Result alias for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors raised by the managers and the orchestration loop.
///
/// Recoverable conditions stay confined to the component that raised
/// them; only goal-level fatal conditions (unparseable plan, oracle
/// hard-failure during planning) escalate to a goal status change.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("agent name already in use: {0}")]
    DuplicateAgentName(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("goal not found: {0}")]
    GoalNotFound(Uuid),

    #[error("trigger not found: {0}")]
    TriggerNotFound(Uuid),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("agent {0} has no active session")]
    NoActiveSession(Uuid),

    #[error("agent {0} is already running a worker session")]
    AgentBusy(Uuid),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("worker runtime failure: {0}")]
    Worker(#[from] WorkerError),

    #[error("oracle failure: {0}")]
    Oracle(String),
}
