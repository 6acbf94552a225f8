//! Domain models for the orchestration engine.

pub mod agent;
pub mod goal;
pub mod plan;
pub mod preference;
pub mod session;
pub mod task;
pub mod trigger;
pub mod workspace;

pub use agent::{Agent, AgentMemory, AgentState, ConversationEntry, BASELINE_TOOLS, MEMORY_LIMIT};
pub use goal::{AgentGoal, GoalStatus};
pub use plan::{AgentPlan, PlanLifecycle, PlanStep, StepStatus};
pub use preference::{AgentPreference, Confidence};
pub use session::{
    AgentSession, MessageType, PendingPermission, SessionMessage, SessionStatus,
};
pub use task::{Task, TaskLogEntry, TaskStatus, TASK_LOG_LIMIT};
pub use trigger::{AgentTrigger, TriggerType};
pub use workspace::WorkspaceConfig;
