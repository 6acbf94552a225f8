//! Goals, versioned plans, plan steps, and triggers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentGoal, AgentPlan, AgentTrigger, GoalStatus, PlanLifecycle, PlanStep, StepStatus,
};
use crate::domain::ports::store::StateStore;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};

/// In-place mutation of one plan step.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub description: Option<String>,
    pub result: Option<String>,
    pub task_id: Option<Uuid>,
    pub question: Option<String>,
    pub clear_question: bool,
}

impl StepPatch {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn without_question(mut self) -> Self {
        self.clear_question = true;
        self
    }

    pub fn description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }
}

/// Owns goals, each goal's current plan, and triggers.
pub struct GoalManager {
    goals: RwLock<HashMap<Uuid, AgentGoal>>,
    /// Current plan per goal; replaced wholesale on re-plan.
    plans: RwLock<HashMap<Uuid, AgentPlan>>,
    triggers: RwLock<HashMap<Uuid, AgentTrigger>>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
}

impl GoalManager {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            goals: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    pub async fn initialize(&self) {
        match self.store.load_goal_state().await {
            Ok((goals, plans)) => {
                let mut goal_map = self.goals.write().await;
                for goal in goals {
                    goal_map.insert(goal.id, goal);
                }
                let mut plan_map = self.plans.write().await;
                for plan in plans {
                    plan_map.insert(plan.goal_id, plan);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load goals"),
        }
        match self.store.load_triggers().await {
            Ok(triggers) => {
                let mut map = self.triggers.write().await;
                for trigger in triggers {
                    map.insert(trigger.id, trigger);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load triggers"),
        }
    }

    // ------------------------------------------------------------------
    // Goals
    // ------------------------------------------------------------------

    #[instrument(skip(self, description))]
    pub async fn create_goal(
        &self,
        agent_id: Uuid,
        description: impl Into<String> + Send,
        working_directory: PathBuf,
    ) -> DomainResult<AgentGoal> {
        let goal = AgentGoal::new(agent_id, description, working_directory);
        goal.validate().map_err(DomainError::ValidationFailed)?;

        self.goals.write().await.insert(goal.id, goal.clone());
        self.persist_goal_state().await;
        self.bus.publish(
            EngineEvent::new(EnginePayload::GoalCreated {
                goal_id: goal.id,
                agent_id,
                description: goal.description.clone(),
            })
            .with_agent(agent_id)
            .with_goal(goal.id),
        );
        Ok(goal)
    }

    pub async fn get_goal(&self, id: Uuid) -> Option<AgentGoal> {
        self.goals.read().await.get(&id).cloned()
    }

    pub async fn list_goals(&self) -> Vec<AgentGoal> {
        let mut goals: Vec<AgentGoal> = self.goals.read().await.values().cloned().collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        goals
    }

    pub async fn list_goals_for_agent(&self, agent_id: Uuid) -> Vec<AgentGoal> {
        let mut goals: Vec<AgentGoal> = self
            .goals
            .read()
            .await
            .values()
            .filter(|g| g.agent_id == agent_id)
            .cloned()
            .collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        goals
    }

    /// The agent's newest non-terminal goal, if any.
    pub async fn active_goal_for_agent(&self, agent_id: Uuid) -> Option<AgentGoal> {
        self.goals
            .read()
            .await
            .values()
            .filter(|g| g.agent_id == agent_id && !g.status.is_terminal())
            .max_by_key(|g| g.created_at)
            .cloned()
    }

    #[instrument(skip(self))]
    pub async fn update_goal_status(&self, id: Uuid, status: GoalStatus) -> DomainResult<()> {
        let from = {
            let mut goals = self.goals.write().await;
            let goal = goals.get_mut(&id).ok_or(DomainError::GoalNotFound(id))?;
            let from = goal.status;
            goal.transition_to(status)
                .map_err(DomainError::InvalidTransition)?;
            from
        };
        self.persist_goal_state().await;
        if from != status {
            self.bus.publish(
                EngineEvent::new(EnginePayload::GoalStatusChanged {
                    goal_id: id,
                    from: from.as_str().to_string(),
                    to: status.as_str().to_string(),
                })
                .with_goal(id),
            );
        }
        Ok(())
    }

    pub async fn append_constraint(&self, id: Uuid, constraint: impl Into<String> + Send) -> DomainResult<()> {
        {
            let mut goals = self.goals.write().await;
            let goal = goals.get_mut(&id).ok_or(DomainError::GoalNotFound(id))?;
            goal.constraints.push(constraint.into());
            goal.touch();
        }
        self.persist_goal_state().await;
        Ok(())
    }

    pub async fn set_working_directory(&self, id: Uuid, path: PathBuf) -> DomainResult<()> {
        {
            let mut goals = self.goals.write().await;
            let goal = goals.get_mut(&id).ok_or(DomainError::GoalNotFound(id))?;
            goal.working_directory = path;
            goal.touch();
        }
        self.persist_goal_state().await;
        Ok(())
    }

    /// Delete an agent's goals with their plans and triggers.
    pub async fn delete_goals_for_agent(&self, agent_id: Uuid) -> usize {
        let goal_ids: Vec<Uuid> = {
            let mut goals = self.goals.write().await;
            let ids: Vec<Uuid> = goals
                .values()
                .filter(|g| g.agent_id == agent_id)
                .map(|g| g.id)
                .collect();
            for id in &ids {
                goals.remove(id);
            }
            ids
        };
        {
            let mut plans = self.plans.write().await;
            for id in &goal_ids {
                plans.remove(id);
            }
        }
        {
            let mut triggers = self.triggers.write().await;
            triggers.retain(|_, t| t.agent_id != agent_id);
        }
        self.persist_goal_state().await;
        self.persist_triggers().await;
        goal_ids.len()
    }

    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    /// Replace the goal's plan, bumping the version.
    #[instrument(skip(self, descriptions, reasoning, lifecycle))]
    pub async fn set_plan(
        &self,
        goal_id: Uuid,
        descriptions: Vec<String>,
        reasoning: impl Into<String> + Send,
        lifecycle: PlanLifecycle,
    ) -> DomainResult<AgentPlan> {
        if self.goals.read().await.get(&goal_id).is_none() {
            return Err(DomainError::GoalNotFound(goal_id));
        }
        if descriptions.is_empty() {
            return Err(DomainError::ValidationFailed(
                "a plan needs at least one step".to_string(),
            ));
        }

        let plan = {
            let mut plans = self.plans.write().await;
            let version = plans.get(&goal_id).map_or(1, |p| p.version + 1);
            let plan = AgentPlan::new(goal_id, version, reasoning, descriptions, lifecycle);
            plans.insert(goal_id, plan.clone());
            plan
        };
        self.persist_goal_state().await;
        self.bus.publish(
            EngineEvent::new(EnginePayload::PlanCreated {
                goal_id,
                version: plan.version,
                step_count: plan.steps.len(),
            })
            .with_goal(goal_id),
        );
        Ok(plan)
    }

    pub async fn get_current_plan(&self, goal_id: Uuid) -> Option<AgentPlan> {
        self.plans.read().await.get(&goal_id).cloned()
    }

    /// Mutate one step in place. Publishes `step_started`,
    /// `step_completed`, or `step_failed` when the patch changes status.
    pub async fn update_plan_step(
        &self,
        goal_id: Uuid,
        step_id: Uuid,
        patch: StepPatch,
    ) -> DomainResult<PlanStep> {
        let (step, topic) = {
            let mut plans = self.plans.write().await;
            let plan = plans
                .get_mut(&goal_id)
                .ok_or(DomainError::GoalNotFound(goal_id))?;
            let step = plan.step_mut(step_id).ok_or_else(|| {
                DomainError::ValidationFailed(format!("no step {step_id} in plan"))
            })?;

            if let Some(description) = patch.description {
                step.description = description;
            }
            if let Some(result) = patch.result {
                step.result = Some(result);
            }
            if let Some(task_id) = patch.task_id {
                step.task_id = Some(task_id);
            }
            if let Some(question) = patch.question {
                step.question = Some(question);
            }
            if patch.clear_question {
                step.question = None;
            }

            let mut topic = None;
            if let Some(status) = patch.status {
                let changed = step.status != status;
                step.status = status;
                topic = match status {
                    StepStatus::InProgress if changed => {
                        Some(EnginePayload::StepStarted { goal_id, step_id })
                    }
                    StepStatus::Completed if changed => {
                        step.completed_at = Some(Utc::now());
                        Some(EnginePayload::StepCompleted { goal_id, step_id })
                    }
                    StepStatus::Failed if changed => {
                        Some(EnginePayload::StepFailed { goal_id, step_id })
                    }
                    _ => None,
                };
            }
            let step_clone = step.clone();
            plan.updated_at = Utc::now();
            (step_clone, topic)
        };
        self.persist_goal_state().await;
        if let Some(payload) = topic {
            self.bus.publish(EngineEvent::new(payload).with_goal(goal_id));
        }
        Ok(step)
    }

    /// The lowest-order pending step of the goal's current plan.
    pub async fn get_next_pending_step(&self, goal_id: Uuid) -> Option<PlanStep> {
        self.plans
            .read()
            .await
            .get(&goal_id)
            .and_then(|p| p.next_pending_step().cloned())
    }

    /// Any blocked step of the goal's current plan.
    pub async fn get_blocked_step(&self, goal_id: Uuid) -> Option<PlanStep> {
        self.plans
            .read()
            .await
            .get(&goal_id)
            .and_then(|p| p.blocked_step().cloned())
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    pub async fn add_trigger(&self, trigger: AgentTrigger) -> AgentTrigger {
        self.triggers.write().await.insert(trigger.id, trigger.clone());
        self.persist_triggers().await;
        trigger
    }

    pub async fn remove_trigger(&self, id: Uuid) -> DomainResult<()> {
        let removed = self.triggers.write().await.remove(&id);
        if removed.is_none() {
            return Err(DomainError::TriggerNotFound(id));
        }
        self.persist_triggers().await;
        Ok(())
    }

    pub async fn get_trigger(&self, id: Uuid) -> Option<AgentTrigger> {
        self.triggers.read().await.get(&id).cloned()
    }

    pub async fn list_triggers(&self) -> Vec<AgentTrigger> {
        self.triggers.read().await.values().cloned().collect()
    }

    pub async fn triggers_for_agent(&self, agent_id: Uuid) -> Vec<AgentTrigger> {
        self.triggers
            .read()
            .await
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub async fn triggers_for_goal(&self, goal_id: Uuid) -> Vec<AgentTrigger> {
        self.triggers
            .read()
            .await
            .values()
            .filter(|t| t.goal_id == goal_id)
            .cloned()
            .collect()
    }

    pub async fn mark_trigger_fired(&self, id: Uuid, now: DateTime<Utc>) -> DomainResult<()> {
        {
            let mut triggers = self.triggers.write().await;
            let trigger = triggers.get_mut(&id).ok_or(DomainError::TriggerNotFound(id))?;
            trigger.mark_fired(now);
        }
        self.persist_triggers().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn persist_goal_state(&self) {
        let goals: Vec<AgentGoal> = {
            let map = self.goals.read().await;
            let mut list: Vec<AgentGoal> = map.values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            list
        };
        let plans: Vec<AgentPlan> = {
            let map = self.plans.read().await;
            let mut list: Vec<AgentPlan> = map.values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            list
        };
        if let Err(e) = self.store.save_goal_state(&goals, &plans).await {
            tracing::warn!(error = %e, "failed to persist goal state");
        }
    }

    async fn persist_triggers(&self) {
        let snapshot: Vec<AgentTrigger> = {
            let map = self.triggers.read().await;
            let mut list: Vec<AgentTrigger> = map.values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            list
        };
        if let Err(e) = self.store.save_triggers(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist triggers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStateStore;

    fn manager() -> GoalManager {
        GoalManager::new(Arc::new(InMemoryStateStore::new()), Arc::new(EventBus::default()))
    }

    async fn goal(manager: &GoalManager) -> AgentGoal {
        manager
            .create_goal(Uuid::new_v4(), "optimize queries", PathBuf::from("/tmp"))
            .await
            .unwrap()
    }

    fn steps(descriptions: &[&str]) -> Vec<String> {
        descriptions.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_plan_bumps_version() {
        let manager = manager();
        let goal = goal(&manager).await;

        let v1 = manager
            .set_plan(goal.id, steps(&["a"]), "first", PlanLifecycle::default())
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let v2 = manager
            .set_plan(goal.id, steps(&["b", "c"]), "second", PlanLifecycle::default())
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        // Only the newest plan is retrievable.
        let current = manager.get_current_plan(goal.id).await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let manager = manager();
        let goal = goal(&manager).await;
        assert!(manager
            .set_plan(goal.id, Vec::new(), "r", PlanLifecycle::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_step_patch_publishes_status_topics() {
        let bus = Arc::new(EventBus::default());
        let manager = GoalManager::new(Arc::new(InMemoryStateStore::new()), bus.clone());
        let goal = manager
            .create_goal(Uuid::new_v4(), "g", PathBuf::from("/tmp"))
            .await
            .unwrap();
        let plan = manager
            .set_plan(goal.id, steps(&["a"]), "r", PlanLifecycle::default())
            .await
            .unwrap();
        let step_id = plan.steps[0].id;

        let mut rx = bus.subscribe();
        manager
            .update_plan_step(goal.id, step_id, StepPatch::status(StepStatus::InProgress))
            .await
            .unwrap();
        manager
            .update_plan_step(
                goal.id,
                step_id,
                StepPatch::status(StepStatus::Completed).with_result("done"),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().payload.topic(), "step_started");
        assert_eq!(rx.recv().await.unwrap().payload.topic(), "step_completed");

        let step = manager
            .get_current_plan(goal.id)
            .await
            .unwrap()
            .step(step_id)
            .cloned()
            .unwrap();
        assert_eq!(step.result.as_deref(), Some("done"));
        assert!(step.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_next_pending_and_blocked_lookups() {
        let manager = manager();
        let goal = goal(&manager).await;
        let plan = manager
            .set_plan(goal.id, steps(&["a", "b"]), "r", PlanLifecycle::default())
            .await
            .unwrap();

        let first = manager.get_next_pending_step(goal.id).await.unwrap();
        assert_eq!(first.order, 0);

        manager
            .update_plan_step(
                goal.id,
                plan.steps[0].id,
                StepPatch::status(StepStatus::Blocked).with_question("which driver?"),
            )
            .await
            .unwrap();

        let blocked = manager.get_blocked_step(goal.id).await.unwrap();
        assert_eq!(blocked.id, plan.steps[0].id);
        assert_eq!(blocked.question.as_deref(), Some("which driver?"));

        // Clearing the question on resume.
        let resumed = manager
            .update_plan_step(
                goal.id,
                plan.steps[0].id,
                StepPatch::status(StepStatus::InProgress).without_question(),
            )
            .await
            .unwrap();
        assert!(resumed.question.is_none());
        assert!(manager.get_blocked_step(goal.id).await.is_none());
    }

    #[tokio::test]
    async fn test_constraints_and_working_directory_updates() {
        let manager = manager();
        let goal = goal(&manager).await;

        manager.append_constraint(goal.id, "no force pushes").await.unwrap();
        manager.append_constraint(goal.id, "keep CI green").await.unwrap();
        manager
            .set_working_directory(goal.id, PathBuf::from("/projects/api"))
            .await
            .unwrap();

        let stored = manager.get_goal(goal.id).await.unwrap();
        assert_eq!(stored.constraints, vec!["no force pushes", "keep CI green"]);
        assert_eq!(stored.working_directory, PathBuf::from("/projects/api"));
        assert!(stored.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn test_delete_goals_for_agent_cascades() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        let goal = manager
            .create_goal(agent_id, "g", PathBuf::from("/tmp"))
            .await
            .unwrap();
        manager
            .set_plan(goal.id, steps(&["a"]), "r", PlanLifecycle::default())
            .await
            .unwrap();
        manager
            .add_trigger(AgentTrigger::interval(agent_id, goal.id, 60_000))
            .await;

        assert_eq!(manager.delete_goals_for_agent(agent_id).await, 1);
        assert!(manager.get_goal(goal.id).await.is_none());
        assert!(manager.get_current_plan(goal.id).await.is_none());
        assert!(manager.list_triggers().await.is_empty());
    }

    #[tokio::test]
    async fn test_goal_state_round_trip() {
        let store = Arc::new(InMemoryStateStore::new());
        let manager = GoalManager::new(store.clone(), Arc::new(EventBus::default()));
        let goal = manager
            .create_goal(Uuid::new_v4(), "g", PathBuf::from("/tmp"))
            .await
            .unwrap();
        manager
            .set_plan(goal.id, steps(&["a", "b"]), "r", PlanLifecycle::default())
            .await
            .unwrap();

        let reloaded = GoalManager::new(store, Arc::new(EventBus::default()));
        reloaded.initialize().await;
        assert!(reloaded.get_goal(goal.id).await.is_some());
        let plan = reloaded.get_current_plan(goal.id).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.validate().is_ok());
    }
}
