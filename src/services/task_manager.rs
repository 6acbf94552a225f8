//! Ephemeral task records, one per dispatched worker invocation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::store::StateStore;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};

/// Owns task records. Task IDs are the correlation tokens that tie
/// `session_ended` events back to the step that initiated them.
pub struct TaskManager {
    tasks: RwLock<HashMap<Uuid, Task>>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    pub async fn initialize(&self) {
        match self.store.load_tasks().await {
            Ok(tasks) => {
                let mut map = self.tasks.write().await;
                for task in tasks {
                    map.insert(task.id, task);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load tasks"),
        }
    }

    pub async fn create_task(
        &self,
        description: impl Into<String> + Send,
        assigned_agent_id: Option<Uuid>,
    ) -> Task {
        let task = Task::new(description, assigned_agent_id);
        self.tasks.write().await.insert(task.id, task.clone());
        self.persist().await;

        let mut event = EngineEvent::new(EnginePayload::TaskCreated {
            task_id: task.id,
            description: task.description.clone(),
        })
        .with_task(task.id);
        if let Some(agent_id) = assigned_agent_id {
            event = event.with_agent(agent_id);
        }
        self.bus.publish(event);
        task
    }

    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    /// All tasks, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn list_for_agent(&self, agent_id: Uuid) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.assigned_agent_id == Some(agent_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn start_task(&self, id: Uuid) -> DomainResult<()> {
        self.mutate(id, Task::start).await?;
        self.bus
            .publish(EngineEvent::new(EnginePayload::TaskStarted { task_id: id }).with_task(id));
        Ok(())
    }

    pub async fn complete_task(&self, id: Uuid, result: &str) -> DomainResult<()> {
        let result = result.to_string();
        self.mutate(id, move |task| task.complete(result)).await?;
        self.bus
            .publish(EngineEvent::new(EnginePayload::TaskCompleted { task_id: id }).with_task(id));
        Ok(())
    }

    pub async fn fail_task(&self, id: Uuid, error: &str) -> DomainResult<()> {
        let message = error.to_string();
        self.mutate(id, move |task| task.fail(message)).await?;
        self.bus.publish(
            EngineEvent::new(EnginePayload::TaskFailed {
                task_id: id,
                error: error.to_string(),
            })
            .with_task(id),
        );
        Ok(())
    }

    /// Append to the task's bounded log.
    pub async fn add_log(&self, id: Uuid, message: &str) -> DomainResult<()> {
        let line = message.to_string();
        self.mutate(id, move |task| task.push_log(line)).await?;
        self.bus.publish(
            EngineEvent::new(EnginePayload::TaskLog {
                task_id: id,
                message: message.to_string(),
            })
            .with_task(id),
        );
        Ok(())
    }

    /// Drop every task belonging to a fired agent.
    pub async fn delete_for_agent(&self, agent_id: Uuid) -> usize {
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, t| t.assigned_agent_id != Some(agent_id));
            before - tasks.len()
        };
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    async fn mutate(&self, id: Uuid, f: impl FnOnce(&mut Task) + Send) -> DomainResult<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&id).ok_or(DomainError::TaskNotFound(id))?;
            f(task);
        }
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        let snapshot: Vec<Task> = {
            let tasks = self.tasks.read().await;
            let mut list: Vec<Task> = tasks.values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            list
        };
        if let Err(e) = self.store.save_tasks(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TASK_LOG_LIMIT;
    use crate::infrastructure::store::InMemoryStateStore;

    fn manager() -> TaskManager {
        TaskManager::new(Arc::new(InMemoryStateStore::new()), Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_task_state_changes_publish_topics() {
        let bus = Arc::new(EventBus::default());
        let manager = TaskManager::new(Arc::new(InMemoryStateStore::new()), bus.clone());
        let mut rx = bus.subscribe();

        let task = manager.create_task("do it", None).await;
        manager.start_task(task.id).await.unwrap();
        manager.complete_task(task.id, "done").await.unwrap();

        let mut topics = Vec::new();
        for _ in 0..3 {
            topics.push(rx.recv().await.unwrap().payload.topic());
        }
        assert_eq!(topics, vec!["task_created", "task_started", "task_completed"]);

        let stored = manager.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_task_logs_are_ring_buffered() {
        let manager = manager();
        let task = manager.create_task("noisy", None).await;
        for i in 0..(TASK_LOG_LIMIT + 5) {
            manager.add_log(task.id, &format!("line {i}")).await.unwrap();
        }
        let stored = manager.get(task.id).await.unwrap();
        assert_eq!(stored.logs.len(), TASK_LOG_LIMIT);
    }

    #[tokio::test]
    async fn test_delete_for_agent() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        manager.create_task("a", Some(agent_id)).await;
        manager.create_task("b", Some(agent_id)).await;
        manager.create_task("c", None).await;

        assert_eq!(manager.delete_for_agent(agent_id).await, 2);
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let manager = manager();
        assert!(matches!(
            manager.start_task(Uuid::new_v4()).await,
            Err(DomainError::TaskNotFound(_))
        ));
    }
}
