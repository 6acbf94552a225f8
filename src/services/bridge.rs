//! Facade over agents, tasks, and sessions.
//!
//! The bridge is the single dispatch point for worker invocations. It
//! enforces one in-flight execution per agent, sweeps stale state on
//! startup, and settles ended sessions (task, memory, counters, guard)
//! *before* publishing `session_ended`, so subscribers always observe
//! fully-settled state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentGoal, AgentState, SessionStatus, TaskStatus};
use crate::domain::ports::worker::WorkerStreamEvent;
use crate::services::agent_manager::AgentManager;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};
use crate::services::goal_manager::GoalManager;
use crate::services::preference_manager::PreferenceManager;
use crate::services::session_manager::{SessionEnd, SessionManager};
use crate::services::task_manager::TaskManager;
use crate::services::workspace::WorkspaceRegistry;

const RESTART_INTERRUPTION: &str = "interrupted by restart";

pub struct Bridge {
    agents: Arc<AgentManager>,
    tasks: Arc<TaskManager>,
    sessions: Arc<SessionManager>,
    goals: Arc<GoalManager>,
    preferences: Arc<PreferenceManager>,
    workspace: Arc<WorkspaceRegistry>,
    /// Single-flight guard: agents with a dispatch in flight.
    active_executions: Mutex<HashSet<Uuid>>,
    bus: Arc<EventBus>,
}

impl Bridge {
    pub fn new(
        agents: Arc<AgentManager>,
        tasks: Arc<TaskManager>,
        sessions: Arc<SessionManager>,
        goals: Arc<GoalManager>,
        preferences: Arc<PreferenceManager>,
        workspace: Arc<WorkspaceRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agents,
            tasks,
            sessions,
            goals,
            preferences,
            workspace,
            active_executions: Mutex::new(HashSet::new()),
            bus,
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Sweep stale state left by an unclean shutdown: agents persisted
    /// mid-work go back to idle and their in-flight tasks fail.
    pub async fn initialize(&self) {
        for agent in self.agents.list().await {
            if matches!(agent.state, AgentState::Working | AgentState::Thinking) {
                if let Some(task_id) = agent.current_task_id {
                    let _ = self.tasks.fail_task(task_id, RESTART_INTERRUPTION).await;
                }
                let _ = self.agents.unassign_task(agent.id).await;
                let _ = self.agents.update_state(agent.id, AgentState::Idle).await;
            }
        }
        for task in self.tasks.list().await {
            if task.status == TaskStatus::InProgress {
                let _ = self.tasks.fail_task(task.id, RESTART_INTERRUPTION).await;
            }
        }
    }

    /// Consume worker stream events, settling sessions as they end.
    pub fn start_event_pump(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WorkerStreamEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(end) = self.sessions.handle_worker_event(event).await {
                    self.settle(end).await;
                }
            }
        })
    }

    pub async fn is_busy(&self, agent_id: Uuid) -> bool {
        self.active_executions.lock().await.contains(&agent_id)
    }

    /// Start a worker session for the task, or fail fast when the agent
    /// already has one in flight.
    #[instrument(skip(self, prompt), fields(agent_id = %agent_id, task_id = %task_id))]
    pub async fn dispatch_worker(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        max_turns: Option<u32>,
        working_dir: PathBuf,
        prompt: String,
    ) -> DomainResult<Uuid> {
        {
            let mut guard = self.active_executions.lock().await;
            if !guard.insert(agent_id) {
                return Err(DomainError::AgentBusy(agent_id));
            }
        }

        match self
            .dispatch_inner(agent_id, task_id, max_turns, working_dir, prompt)
            .await
        {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                self.active_executions.lock().await.remove(&agent_id);
                let _ = self.tasks.fail_task(task_id, &format!("dispatch failed: {e}")).await;
                let _ = self.agents.unassign_task(agent_id).await;
                let _ = self.agents.update_state(agent_id, AgentState::Idle).await;
                Err(e)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        max_turns: Option<u32>,
        working_dir: PathBuf,
        prompt: String,
    ) -> DomainResult<Uuid> {
        let agent = self
            .agents
            .get(agent_id)
            .await
            .ok_or(DomainError::AgentNotFound(agent_id))?;

        self.agents.update_state(agent_id, AgentState::Working).await?;
        self.agents.assign_task(agent_id, task_id).await?;
        self.tasks.start_task(task_id).await?;

        let allowed_tools: Vec<String> = agent.approved_tools.iter().cloned().collect();
        let session_id = self
            .sessions
            .start_session(
                agent_id,
                task_id,
                prompt,
                working_dir,
                agent.system_prompt.clone(),
                allowed_tools,
                max_turns,
                self.workspace.roots().await,
            )
            .await?;
        let _ = self
            .tasks
            .add_log(task_id, &format!("worker session {session_id} started"))
            .await;
        Ok(session_id)
    }

    /// Bookkeeping for an ended session, then `session_ended`.
    async fn settle(&self, end: SessionEnd) {
        match end.status {
            SessionStatus::Completed => {
                let _ = self.tasks.complete_task(end.task_id, &end.result).await;
            }
            _ => {
                let message = end
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker session ended in error".to_string());
                let _ = self.tasks.fail_task(end.task_id, &message).await;
            }
        }

        if !end.prompt.is_empty() {
            let _ = self
                .agents
                .add_conversation(end.agent_id, "user", &end.prompt, Some(end.task_id))
                .await;
        }
        if !end.result.is_empty() {
            let _ = self
                .agents
                .add_conversation(end.agent_id, "assistant", &end.result, Some(end.task_id))
                .await;
        }
        if end.tokens_used > 0 {
            let _ = self.agents.add_tokens_used(end.agent_id, end.tokens_used).await;
        }

        let _ = self
            .tasks
            .add_log(
                end.task_id,
                &format!("worker session ended ({})", end.status.as_str()),
            )
            .await;
        let _ = self.agents.unassign_task(end.agent_id).await;
        let _ = self.agents.update_state(end.agent_id, AgentState::Idle).await;
        self.active_executions.lock().await.remove(&end.agent_id);

        self.bus.publish(
            EngineEvent::new(EnginePayload::SessionEnded {
                session_id: end.session_id,
                agent_id: end.agent_id,
                task_id: end.task_id,
                status: end.status.as_str().to_string(),
                result: if end.status == SessionStatus::Completed {
                    end.result
                } else {
                    end.error.unwrap_or_default()
                },
            })
            .with_agent(end.agent_id)
            .with_task(end.task_id),
        );
    }

    /// Resolve one denied tool: adds it to the agent's approved set and
    /// resumes the session once every pending denial is cleared.
    /// Returns true when the session resumed.
    pub async fn approve_tool_permission(
        &self,
        agent_id: Uuid,
        tool_name: &str,
    ) -> DomainResult<bool> {
        let session = self
            .sessions
            .session_for_agent(agent_id)
            .await
            .ok_or(DomainError::NoActiveSession(agent_id))?;

        let decision = self.sessions.approve_permission(session.id, tool_name).await?;
        if let Some(canonical) = decision.canonical_name {
            self.agents.add_approved_tool(agent_id, canonical).await?;
        }

        if decision.all_approved {
            let agent = self
                .agents
                .get(agent_id)
                .await
                .ok_or(DomainError::AgentNotFound(agent_id))?;
            let tools: Vec<String> = agent.approved_tools.iter().cloned().collect();
            self.sessions
                .resume_session(session.id, tools, session.working_dir.clone())
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Refuse the pending permissions; the session ends normally.
    pub async fn deny_tool_permission(&self, agent_id: Uuid) -> DomainResult<()> {
        let session = self
            .sessions
            .session_for_agent(agent_id)
            .await
            .ok_or(DomainError::NoActiveSession(agent_id))?;
        if let Some(end) = self.sessions.deny_permission(session.id).await? {
            self.settle(end).await;
        }
        Ok(())
    }

    /// Kill the agent's active session. Returns false when none exists.
    pub async fn cancel_execution(&self, agent_id: Uuid) -> DomainResult<bool> {
        let Some(session) = self.sessions.session_for_agent(agent_id).await else {
            return Ok(false);
        };
        if let Some(end) = self.sessions.stop_session(session.id).await? {
            self.settle(end).await;
        }
        Ok(true)
    }

    /// Fire an agent: cancel its session, then cascade through goals,
    /// preferences, tasks, and the roster.
    pub async fn fire_agent(&self, agent_id: Uuid) -> DomainResult<Agent> {
        let _ = self.cancel_execution(agent_id).await;
        self.goals.delete_goals_for_agent(agent_id).await;
        self.preferences.clear_agent(agent_id).await;
        self.tasks.delete_for_agent(agent_id).await;
        self.active_executions.lock().await.remove(&agent_id);
        self.agents.fire(agent_id).await
    }

    /// Render the full worker prompt for one plan step.
    pub async fn compose_worker_prompt(
        &self,
        agent: &Agent,
        goal: &AgentGoal,
        instruction: &str,
        prior: &[(String, String)],
    ) -> String {
        let prior_context = if prior.is_empty() {
            "No steps have completed yet.".to_string()
        } else {
            prior
                .iter()
                .enumerate()
                .map(|(i, (description, result))| {
                    format!("Step {} ({description}):\n{result}", i + 1)
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let constraints = if goal.constraints.is_empty() {
            "None.".to_string()
        } else {
            goal.constraints
                .iter()
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let roots = self.workspace.roots().await;
        let roots = if roots.is_empty() {
            "None configured.".to_string()
        } else {
            roots
                .iter()
                .map(|r| format!("- {}", r.display()))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let preferences = self.preferences.build_preference_context(goal.agent_id).await;
        let preferences = if preferences.is_empty() {
            "None recorded.".to_string()
        } else {
            preferences
        };

        format!(
            r#"You are {name}, an autonomous worker agent.

## Goal (verbatim, do not reinterpret)
{goal}

## Results of completed steps
<prior_context>
{prior_context}
</prior_context>

## Your instruction for this step
<worker_instruction>
{instruction}
</worker_instruction>

## Environment
Working directory: {working_dir}
Workspace roots:
{roots}

## Constraints
{constraints}

## Operator preferences
{preferences}
When you rely on one of these preferences, note it on its own line as
[Used preference: KEY].

## Reporting
Close your final message with a <step_summary> block describing what you
did and any findings the next step needs. If you cannot proceed without
an operator decision, end your message with:
[NEEDS_INPUT]: <your question>"#,
            name = agent.name,
            goal = goal.description,
            prior_context = prior_context,
            instruction = instruction,
            working_dir = goal.working_directory.display(),
            roots = roots,
            constraints = constraints,
            preferences = preferences,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::domain::ports::worker::{WorkerError, WorkerEvent, WorkerLaunch, WorkerRuntime};
    use crate::infrastructure::store::InMemoryStateStore;

    /// Runtime double: records launches, emits nothing by itself.
    struct RecordingRuntime {
        launches: std::sync::Mutex<Vec<WorkerLaunch>>,
    }

    impl RecordingRuntime {
        fn new() -> Self {
            Self {
                launches: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkerRuntime for RecordingRuntime {
        async fn spawn(&self, launch: WorkerLaunch) -> Result<(), WorkerError> {
            self.launches.lock().unwrap().push(launch);
            Ok(())
        }
        async fn resume(&self, launch: WorkerLaunch) -> Result<(), WorkerError> {
            self.launches.lock().unwrap().push(launch);
            Ok(())
        }
        async fn kill(&self, _session_id: Uuid) -> Result<bool, WorkerError> {
            Ok(true)
        }
    }

    struct Fixture {
        bridge: Arc<Bridge>,
        agents: Arc<AgentManager>,
        tasks: Arc<TaskManager>,
        bus: Arc<EventBus>,
        events_tx: mpsc::UnboundedSender<WorkerStreamEvent>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn crate::domain::ports::store::StateStore> =
            Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(EventBus::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let agents = Arc::new(AgentManager::new(store.clone(), bus.clone()));
        let tasks = Arc::new(TaskManager::new(store.clone(), bus.clone()));
        let goals = Arc::new(GoalManager::new(store.clone(), bus.clone()));
        let preferences = Arc::new(PreferenceManager::new(store.clone(), bus.clone()));
        let workspace = Arc::new(WorkspaceRegistry::new(store.clone()));
        let sessions = Arc::new(SessionManager::new(Arc::new(RecordingRuntime::new()), bus.clone()));
        let bridge = Arc::new(Bridge::new(
            agents.clone(),
            tasks.clone(),
            sessions,
            goals,
            preferences,
            workspace,
            bus.clone(),
        ));
        bridge.clone().start_event_pump(events_rx);

        Fixture {
            bridge,
            agents,
            tasks,
            bus,
            events_tx,
        }
    }

    fn worker_event(session_id: Uuid, json: serde_json::Value) -> WorkerStreamEvent {
        WorkerStreamEvent {
            session_id,
            event: serde_json::from_value::<WorkerEvent>(json).expect("event"),
        }
    }

    async fn wait_for_session_ended(
        rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    ) -> EngineEvent {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("bus closed");
            if matches!(event.payload, EnginePayload::SessionEnded { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_enforces_single_flight() {
        let f = fixture();
        let agent = f.agents.hire(None).await.unwrap();
        let task_a = f.tasks.create_task("a", Some(agent.id)).await;
        let task_b = f.tasks.create_task("b", Some(agent.id)).await;

        f.bridge
            .dispatch_worker(agent.id, task_a.id, None, PathBuf::from("/tmp"), "go".to_string())
            .await
            .unwrap();
        assert!(f.bridge.is_busy(agent.id).await);

        let second = f
            .bridge
            .dispatch_worker(agent.id, task_b.id, None, PathBuf::from("/tmp"), "go".to_string())
            .await;
        assert!(matches!(second, Err(DomainError::AgentBusy(_))));
    }

    #[tokio::test]
    async fn test_settlement_updates_everything_before_session_ended() {
        let f = fixture();
        let agent = f.agents.hire(None).await.unwrap();
        let task = f.tasks.create_task("work", Some(agent.id)).await;

        let session_id = f
            .bridge
            .dispatch_worker(agent.id, task.id, None, PathBuf::from("/tmp"), "go".to_string())
            .await
            .unwrap();

        let mut rx = f.bus.subscribe();
        f.events_tx
            .send(worker_event(
                session_id,
                serde_json::json!({"type": "assistant", "message": {"content": "all done"}}),
            ))
            .unwrap();
        f.events_tx
            .send(worker_event(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success",
                    "usage": {"input_tokens": 100, "output_tokens": 20}}),
            ))
            .unwrap();

        let ended = wait_for_session_ended(&mut rx).await;
        let EnginePayload::SessionEnded { status, result, .. } = ended.payload else {
            unreachable!()
        };
        assert_eq!(status, "completed");
        assert_eq!(result, "all done");

        // Settlement happened before the event was published.
        let task = f.tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let agent = f.agents.get(agent.id).await.unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert_eq!(agent.tokens_used, 120);
        assert!(!f.bridge.is_busy(agent.id).await);

        let memory = f.agents.get_memory(agent.id).await;
        assert_eq!(memory.conversations.len(), 2);
        assert_eq!(memory.conversations[0].role, "user");
        assert_eq!(memory.conversations[1].content, "all done");
    }

    #[tokio::test]
    async fn test_failed_session_fails_task_without_completion_count() {
        let f = fixture();
        let agent = f.agents.hire(None).await.unwrap();
        let task = f.tasks.create_task("work", Some(agent.id)).await;
        let session_id = f
            .bridge
            .dispatch_worker(agent.id, task.id, None, PathBuf::from("/tmp"), "go".to_string())
            .await
            .unwrap();

        let mut rx = f.bus.subscribe();
        f.events_tx
            .send(worker_event(
                session_id,
                serde_json::json!({"type": "result", "subtype": "error", "error": "exploded"}),
            ))
            .unwrap();

        wait_for_session_ended(&mut rx).await;
        let task = f.tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_deref(), Some("exploded"));
    }

    #[tokio::test]
    async fn test_initialize_sweeps_stale_state() {
        let f = fixture();
        let agent = f.agents.hire(None).await.unwrap();
        let task = f.tasks.create_task("stale", Some(agent.id)).await;
        f.tasks.start_task(task.id).await.unwrap();
        f.agents.update_state(agent.id, AgentState::Working).await.unwrap();
        f.agents.assign_task(agent.id, task.id).await.unwrap();

        f.bridge.initialize().await;

        let agent = f.agents.get(agent.id).await.unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.current_task_id.is_none());
        let task = f.tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_deref(), Some(RESTART_INTERRUPTION));
    }
}
