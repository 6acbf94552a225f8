//! Application services for the orchestration engine.

pub mod adversary;
pub mod agent_manager;
pub mod bridge;
pub mod event_bus;
pub mod goal_manager;
pub mod lenient_json;
pub mod preference_manager;
pub mod session_manager;
pub mod task_manager;
pub mod trigger_scheduler;
pub mod workspace;

pub use adversary::Adversary;
pub use agent_manager::AgentManager;
pub use bridge::Bridge;
pub use event_bus::{EngineEvent, EnginePayload, EventBus};
pub use goal_manager::{GoalManager, StepPatch};
pub use preference_manager::PreferenceManager;
pub use session_manager::{PermissionDecision, SessionEnd, SessionManager};
pub use task_manager::TaskManager;
pub use trigger_scheduler::TriggerScheduler;
pub use workspace::WorkspaceRegistry;
