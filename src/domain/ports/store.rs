//! Persistence port.
//!
//! Opaque load/save per entity family plus an append-only per-agent
//! event log. Saves are last-writer-wins with no cross-file atomicity;
//! a failed save leaves the in-memory state authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{
    Agent, AgentGoal, AgentMemory, AgentPlan, AgentPreference, AgentTrigger, Task,
    WorkspaceConfig,
};

/// Errors raised by a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Time bounds for a log query.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Opaque persistence for every entity family.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn save_agents(&self, agents: &[Agent]) -> StoreResult<()>;

    async fn load_tasks(&self) -> StoreResult<Vec<Task>>;
    async fn save_tasks(&self, tasks: &[Task]) -> StoreResult<()>;

    /// Goals and their current plans, persisted together.
    async fn load_goal_state(&self) -> StoreResult<(Vec<AgentGoal>, Vec<AgentPlan>)>;
    async fn save_goal_state(
        &self,
        goals: &[AgentGoal],
        plans: &[AgentPlan],
    ) -> StoreResult<()>;

    async fn load_triggers(&self) -> StoreResult<Vec<AgentTrigger>>;
    async fn save_triggers(&self, triggers: &[AgentTrigger]) -> StoreResult<()>;

    async fn load_preferences(&self, agent_id: Uuid) -> StoreResult<Vec<AgentPreference>>;
    async fn save_preferences(
        &self,
        agent_id: Uuid,
        prefs: &[AgentPreference],
    ) -> StoreResult<()>;

    async fn load_memory(&self, agent_id: Uuid) -> StoreResult<AgentMemory>;
    async fn save_memory(&self, agent_id: Uuid, memory: &AgentMemory) -> StoreResult<()>;

    async fn load_workspace_config(&self) -> StoreResult<Option<WorkspaceConfig>>;
    async fn save_workspace_config(&self, config: &WorkspaceConfig) -> StoreResult<()>;

    /// Append one observability event to the agent's JSON-lines log.
    async fn append_log(&self, agent_id: Uuid, event: &serde_json::Value) -> StoreResult<()>;

    /// Read back logged events, bounded by the given range.
    async fn read_logs(
        &self,
        agent_id: Uuid,
        range: LogRange,
    ) -> StoreResult<Vec<serde_json::Value>>;

    /// Drop per-agent state (memory, preferences) when an agent is fired.
    async fn clear_agent_data(&self, agent_id: Uuid) -> StoreResult<()>;
}
