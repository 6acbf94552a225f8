//! Agent roster and per-agent conversation memory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentMemory, AgentState};
use crate::domain::ports::store::StateStore;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};

/// Fixed pool of agent names; exhausted pools fall back to "Agent N".
const NAME_POOL: [&str; 16] = [
    "Sam", "Riley", "Quinn", "Avery", "Morgan", "Jordan", "Casey", "Rowan", "Harper", "Emerson",
    "Finley", "Sawyer", "Parker", "Reese", "Dakota", "Ellis",
];

/// Owns agents and their bounded conversation memory.
pub struct AgentManager {
    agents: RwLock<HashMap<Uuid, Agent>>,
    memories: RwLock<HashMap<Uuid, AgentMemory>>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
}

impl AgentManager {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            memories: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    /// Load persisted agents. Store failures are logged; the roster
    /// starts empty in that case.
    pub async fn initialize(&self) {
        match self.store.load_agents().await {
            Ok(agents) => {
                let mut map = self.agents.write().await;
                for agent in agents {
                    map.insert(agent.id, agent);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load agents"),
        }
    }

    /// Hire a new agent. Picks the first unused pool name when none is
    /// given; a taken name is rejected.
    #[instrument(skip(self))]
    pub async fn hire(&self, name: Option<String>) -> DomainResult<Agent> {
        let mut agents = self.agents.write().await;

        let name = match name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(DomainError::ValidationFailed(
                        "agent name cannot be empty".to_string(),
                    ));
                }
                if agents.values().any(|a| a.name.eq_ignore_ascii_case(&name)) {
                    return Err(DomainError::DuplicateAgentName(name));
                }
                name
            }
            None => Self::generate_name(agents.values().map(|a| a.name.as_str())),
        };

        let agent = Agent::new(name);
        agents.insert(agent.id, agent.clone());
        let snapshot = Self::snapshot(&agents);
        drop(agents);

        self.persist(snapshot).await;
        self.bus.publish(
            EngineEvent::new(EnginePayload::AgentHired {
                agent_id: agent.id,
                name: agent.name.clone(),
            })
            .with_agent(agent.id),
        );
        Ok(agent)
    }

    /// Remove an agent and its memory. Cross-manager cascade (sessions,
    /// tasks, goals, preferences) is coordinated by the bridge.
    #[instrument(skip(self))]
    pub async fn fire(&self, id: Uuid) -> DomainResult<Agent> {
        let mut agents = self.agents.write().await;
        let agent = agents.remove(&id).ok_or(DomainError::AgentNotFound(id))?;
        let snapshot = Self::snapshot(&agents);
        drop(agents);

        self.memories.write().await.remove(&id);
        if let Err(e) = self.store.clear_agent_data(id).await {
            tracing::warn!(agent_id = %id, error = %e, "failed to clear agent data");
        }
        self.persist(snapshot).await;
        self.bus.publish(
            EngineEvent::new(EnginePayload::AgentFired {
                agent_id: agent.id,
                name: agent.name.clone(),
            })
            .with_agent(agent.id),
        );
        Ok(agent)
    }

    pub async fn get(&self, id: Uuid) -> Option<Agent> {
        self.agents.read().await.get(&id).cloned()
    }

    /// Case-insensitive lookup by name.
    pub async fn find_by_name(&self, name: &str) -> Option<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All agents, ordered by hire time.
    pub async fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        Self::snapshot(&agents)
    }

    pub async fn update_state(&self, id: Uuid, state: AgentState) -> DomainResult<()> {
        let changed = self
            .mutate(id, |agent| {
                let changed = agent.state != state;
                agent.state = state;
                changed
            })
            .await?;
        if changed {
            self.bus.publish(
                EngineEvent::new(EnginePayload::AgentStateChanged {
                    agent_id: id,
                    state: state.as_str().to_string(),
                })
                .with_agent(id),
            );
        }
        Ok(())
    }

    /// Cosmetic placement for the isometric front-end.
    pub async fn update_position(&self, id: Uuid, x: f32, y: f32) -> DomainResult<()> {
        self.mutate(id, |agent| {
            agent.x = x;
            agent.y = y;
        })
        .await
    }

    pub async fn assign_task(&self, id: Uuid, task_id: Uuid) -> DomainResult<()> {
        self.mutate(id, |agent| agent.current_task_id = Some(task_id))
            .await
    }

    pub async fn unassign_task(&self, id: Uuid) -> DomainResult<()> {
        self.mutate(id, |agent| agent.current_task_id = None).await
    }

    pub async fn increment_tasks_completed(&self, id: Uuid) -> DomainResult<()> {
        self.mutate(id, |agent| agent.tasks_completed += 1).await
    }

    pub async fn add_tokens_used(&self, id: Uuid, tokens: u64) -> DomainResult<()> {
        self.mutate(id, |agent| agent.tokens_used += tokens).await
    }

    pub async fn set_system_prompt(&self, id: Uuid, prompt: Option<String>) -> DomainResult<()> {
        self.mutate(id, |agent| agent.system_prompt = prompt).await
    }

    pub async fn add_approved_tool(&self, id: Uuid, tool: impl Into<String> + Send) -> DomainResult<()> {
        let tool = tool.into();
        self.mutate(id, move |agent| agent.approve_tool(tool)).await
    }

    /// Remove an approved tool. The baseline set is immutable.
    pub async fn remove_approved_tool(&self, id: Uuid, tool: &str) -> DomainResult<bool> {
        let tool = tool.to_string();
        self.mutate(id, move |agent| agent.revoke_tool(&tool)).await
    }

    pub async fn get_memory(&self, id: Uuid) -> AgentMemory {
        if let Some(memory) = self.memories.read().await.get(&id) {
            return memory.clone();
        }
        // Lazily hydrate from the store.
        let memory = self.store.load_memory(id).await.unwrap_or_default();
        self.memories.write().await.insert(id, memory.clone());
        memory
    }

    /// Record one conversation entry, trimming to the retention limit.
    pub async fn add_conversation(
        &self,
        id: Uuid,
        role: &str,
        content: &str,
        task_id: Option<Uuid>,
    ) -> DomainResult<()> {
        if self.agents.read().await.get(&id).is_none() {
            return Err(DomainError::AgentNotFound(id));
        }
        // Hydrate before mutating so older persisted entries survive.
        let _ = self.get_memory(id).await;
        let snapshot = {
            let mut memories = self.memories.write().await;
            let memory = memories.entry(id).or_default();
            memory.record(role, content, task_id);
            memory.clone()
        };
        if let Err(e) = self.store.save_memory(id, &snapshot).await {
            tracing::warn!(agent_id = %id, error = %e, "failed to persist agent memory");
        }
        Ok(())
    }

    async fn mutate<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Agent) -> T + Send,
    ) -> DomainResult<T> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&id).ok_or(DomainError::AgentNotFound(id))?;
        let out = f(agent);
        let snapshot = Self::snapshot(&agents);
        drop(agents);
        self.persist(snapshot).await;
        Ok(out)
    }

    fn snapshot(agents: &HashMap<Uuid, Agent>) -> Vec<Agent> {
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.hired_at.cmp(&b.hired_at).then(a.id.cmp(&b.id)));
        list
    }

    async fn persist(&self, snapshot: Vec<Agent>) {
        if let Err(e) = self.store.save_agents(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist agents");
        }
    }

    fn generate_name<'a>(taken: impl Iterator<Item = &'a str>) -> String {
        let taken: Vec<String> = taken.map(str::to_lowercase).collect();
        for candidate in NAME_POOL {
            if !taken.contains(&candidate.to_lowercase()) {
                return candidate.to_string();
            }
        }
        // Pool exhausted: smallest unused "Agent N".
        let mut n = 1u32;
        loop {
            let candidate = format!("Agent {n}");
            if !taken.contains(&candidate.to_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}
