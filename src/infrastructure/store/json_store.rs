//! JSON-file state store.
//!
//! Layout under the data root:
//!
//! ```text
//! agents.json      tasks.json      goals.json      triggers.json
//! config.json      memory/<agent>.json
//! preferences/<agent>.json         logs/<agent>.jsonl
//! ```
//!
//! `goals.json` holds a heterogeneous array: goal records plain, plan
//! records tagged `"_type": "plan"`. Writes are last-writer-wins; logs
//! are append-only JSON lines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::models::{
    Agent, AgentGoal, AgentMemory, AgentPlan, AgentPreference, AgentTrigger, Task,
    WorkspaceConfig,
};
use crate::domain::ports::store::{LogRange, StateStore, StoreError, StoreResult};

const PLAN_TAG: &str = "plan";

pub struct JsonStateStore {
    root: PathBuf,
}

impl JsonStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the data root and its subdirectories.
    pub async fn initialize(&self) -> StoreResult<()> {
        for dir in ["memory", "preferences", "logs"] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn agent_file(&self, dir: &str, agent_id: Uuid, ext: &str) -> PathBuf {
        self.root.join(dir).join(format!("{agent_id}.{ext}"))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.read_json(&self.file("agents.json")).await?.unwrap_or_default())
    }

    async fn save_agents(&self, agents: &[Agent]) -> StoreResult<()> {
        self.write_json(&self.file("agents.json"), agents).await
    }

    async fn load_tasks(&self) -> StoreResult<Vec<Task>> {
        Ok(self.read_json(&self.file("tasks.json")).await?.unwrap_or_default())
    }

    async fn save_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        self.write_json(&self.file("tasks.json"), tasks).await
    }

    async fn load_goal_state(&self) -> StoreResult<(Vec<AgentGoal>, Vec<AgentPlan>)> {
        let records: Vec<Value> = self
            .read_json(&self.file("goals.json"))
            .await?
            .unwrap_or_default();

        let mut goals = Vec::new();
        let mut plans = Vec::new();
        for mut record in records {
            let is_plan = record.get("_type").and_then(Value::as_str) == Some(PLAN_TAG);
            if is_plan {
                if let Some(map) = record.as_object_mut() {
                    map.remove("_type");
                }
                plans.push(serde_json::from_value(record)?);
            } else {
                goals.push(serde_json::from_value(record)?);
            }
        }
        Ok((goals, plans))
    }

    async fn save_goal_state(
        &self,
        goals: &[AgentGoal],
        plans: &[AgentPlan],
    ) -> StoreResult<()> {
        let mut records = Vec::with_capacity(goals.len() + plans.len());
        for goal in goals {
            records.push(serde_json::to_value(goal)?);
        }
        for plan in plans {
            let mut record = serde_json::to_value(plan)?;
            if let Some(map) = record.as_object_mut() {
                map.insert("_type".to_string(), Value::String(PLAN_TAG.to_string()));
            }
            records.push(record);
        }
        self.write_json(&self.file("goals.json"), &records).await
    }

    async fn load_triggers(&self) -> StoreResult<Vec<AgentTrigger>> {
        Ok(self.read_json(&self.file("triggers.json")).await?.unwrap_or_default())
    }

    async fn save_triggers(&self, triggers: &[AgentTrigger]) -> StoreResult<()> {
        self.write_json(&self.file("triggers.json"), triggers).await
    }

    async fn load_preferences(&self, agent_id: Uuid) -> StoreResult<Vec<AgentPreference>> {
        Ok(self
            .read_json(&self.agent_file("preferences", agent_id, "json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_preferences(
        &self,
        agent_id: Uuid,
        prefs: &[AgentPreference],
    ) -> StoreResult<()> {
        self.write_json(&self.agent_file("preferences", agent_id, "json"), prefs)
            .await
    }

    async fn load_memory(&self, agent_id: Uuid) -> StoreResult<AgentMemory> {
        Ok(self
            .read_json(&self.agent_file("memory", agent_id, "json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_memory(&self, agent_id: Uuid, memory: &AgentMemory) -> StoreResult<()> {
        self.write_json(&self.agent_file("memory", agent_id, "json"), memory)
            .await
    }

    async fn load_workspace_config(&self) -> StoreResult<Option<WorkspaceConfig>> {
        self.read_json(&self.file("config.json")).await
    }

    async fn save_workspace_config(&self, config: &WorkspaceConfig) -> StoreResult<()> {
        self.write_json(&self.file("config.json"), config).await
    }

    async fn append_log(&self, agent_id: Uuid, event: &Value) -> StoreResult<()> {
        let path = self.agent_file("logs", agent_id, "jsonl");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn read_logs(&self, agent_id: Uuid, range: LogRange) -> StoreResult<Vec<Value>> {
        let path = self.agent_file("logs", agent_id, "jsonl");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if in_range(&event, &range) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn clear_agent_data(&self, agent_id: Uuid) -> StoreResult<()> {
        for path in [
            self.agent_file("memory", agent_id, "json"),
            self.agent_file("preferences", agent_id, "json"),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(())
    }
}

fn in_range(event: &Value, range: &LogRange) -> bool {
    if range.since.is_none() && range.until.is_none() {
        return true;
    }
    let Some(ts) = event
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    else {
        return false;
    };
    if let Some(since) = range.since {
        if ts < since {
            return false;
        }
    }
    if let Some(until) = range.until {
        if ts > until {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn store() -> (tempfile::TempDir, JsonStateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path());
        store.initialize().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn test_agents_round_trip() {
        let (_dir, store) = store().await;
        let agents = vec![Agent::new("Sam"), Agent::new("Riley")];

        store.save_agents(&agents).await.unwrap();
        let loaded = store.load_agents().await.unwrap();
        assert_eq!(loaded, agents);
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let (_dir, store) = store().await;
        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(store.load_tasks().await.unwrap().is_empty());
        assert!(store.load_workspace_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_goal_state_tags_plans() {
        let (dir, store) = store().await;
        let goal = AgentGoal::new(Uuid::new_v4(), "g", PathBuf::from("/tmp"));
        let plan = AgentPlan::new(
            goal.id,
            1,
            "r",
            vec!["a".to_string(), "b".to_string()],
            crate::domain::models::PlanLifecycle::default(),
        );

        store.save_goal_state(&[goal.clone()], &[plan.clone()]).await.unwrap();

        // The on-disk array mixes both record kinds, plans tagged.
        let raw = std::fs::read_to_string(dir.path().join("goals.json")).unwrap();
        let records: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 2);
        let tagged: Vec<&Value> = records
            .iter()
            .filter(|r| r.get("_type").and_then(Value::as_str) == Some("plan"))
            .collect();
        assert_eq!(tagged.len(), 1);

        let (goals, plans) = store.load_goal_state().await.unwrap();
        assert_eq!(goals, vec![goal]);
        assert_eq!(plans, vec![plan]);
    }

    #[tokio::test]
    async fn test_append_and_read_logs() {
        let (_dir, store) = store().await;
        let agent_id = Uuid::new_v4();

        let now = Utc::now();
        for i in 0..3 {
            let event = serde_json::json!({
                "timestamp": now.to_rfc3339(),
                "topic": "task_log",
                "n": i,
            });
            store.append_log(agent_id, &event).await.unwrap();
        }

        let all = store.read_logs(agent_id, LogRange::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let none = store
            .read_logs(
                agent_id,
                LogRange {
                    since: Some(now + chrono::Duration::hours(1)),
                    until: None,
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_clear_agent_data() {
        let (_dir, store) = store().await;
        let agent_id = Uuid::new_v4();
        let mut memory = AgentMemory::default();
        memory.record("user", "hello", None);

        store.save_memory(agent_id, &memory).await.unwrap();
        store.clear_agent_data(agent_id).await.unwrap();
        assert_eq!(store.load_memory(agent_id).await.unwrap(), AgentMemory::default());

        // Clearing an agent that has no data is fine.
        store.clear_agent_data(Uuid::new_v4()).await.unwrap();
    }
}
