//! In-memory state store for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::{
    Agent, AgentGoal, AgentMemory, AgentPlan, AgentPreference, AgentTrigger, Task,
    WorkspaceConfig,
};
use crate::domain::ports::store::{LogRange, StateStore, StoreResult};

/// A `StateStore` that keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    agents: Mutex<Vec<Agent>>,
    tasks: Mutex<Vec<Task>>,
    goals: Mutex<(Vec<AgentGoal>, Vec<AgentPlan>)>,
    triggers: Mutex<Vec<AgentTrigger>>,
    preferences: Mutex<HashMap<Uuid, Vec<AgentPreference>>>,
    memories: Mutex<HashMap<Uuid, AgentMemory>>,
    config: Mutex<Option<WorkspaceConfig>>,
    logs: Mutex<HashMap<Uuid, Vec<Value>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.agents.lock().await.clone())
    }

    async fn save_agents(&self, agents: &[Agent]) -> StoreResult<()> {
        *self.agents.lock().await = agents.to_vec();
        Ok(())
    }

    async fn load_tasks(&self) -> StoreResult<Vec<Task>> {
        Ok(self.tasks.lock().await.clone())
    }

    async fn save_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        *self.tasks.lock().await = tasks.to_vec();
        Ok(())
    }

    async fn load_goal_state(&self) -> StoreResult<(Vec<AgentGoal>, Vec<AgentPlan>)> {
        Ok(self.goals.lock().await.clone())
    }

    async fn save_goal_state(
        &self,
        goals: &[AgentGoal],
        plans: &[AgentPlan],
    ) -> StoreResult<()> {
        *self.goals.lock().await = (goals.to_vec(), plans.to_vec());
        Ok(())
    }

    async fn load_triggers(&self) -> StoreResult<Vec<AgentTrigger>> {
        Ok(self.triggers.lock().await.clone())
    }

    async fn save_triggers(&self, triggers: &[AgentTrigger]) -> StoreResult<()> {
        *self.triggers.lock().await = triggers.to_vec();
        Ok(())
    }

    async fn load_preferences(&self, agent_id: Uuid) -> StoreResult<Vec<AgentPreference>> {
        Ok(self
            .preferences
            .lock()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_preferences(
        &self,
        agent_id: Uuid,
        prefs: &[AgentPreference],
    ) -> StoreResult<()> {
        self.preferences.lock().await.insert(agent_id, prefs.to_vec());
        Ok(())
    }

    async fn load_memory(&self, agent_id: Uuid) -> StoreResult<AgentMemory> {
        Ok(self
            .memories
            .lock()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_memory(&self, agent_id: Uuid, memory: &AgentMemory) -> StoreResult<()> {
        self.memories.lock().await.insert(agent_id, memory.clone());
        Ok(())
    }

    async fn load_workspace_config(&self) -> StoreResult<Option<WorkspaceConfig>> {
        Ok(self.config.lock().await.clone())
    }

    async fn save_workspace_config(&self, config: &WorkspaceConfig) -> StoreResult<()> {
        *self.config.lock().await = Some(config.clone());
        Ok(())
    }

    async fn append_log(&self, agent_id: Uuid, event: &Value) -> StoreResult<()> {
        self.logs
            .lock()
            .await
            .entry(agent_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read_logs(&self, agent_id: Uuid, _range: LogRange) -> StoreResult<Vec<Value>> {
        Ok(self
            .logs
            .lock()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_agent_data(&self, agent_id: Uuid) -> StoreResult<()> {
        self.preferences.lock().await.remove(&agent_id);
        self.memories.lock().await.remove(&agent_id);
        Ok(())
    }
}
