//! The orchestration brain.
//!
//! Drives the recon → plan → execute → evaluate → refine loop for each
//! goal. The adversary only talks to the oracle; all tool work happens
//! in worker sessions dispatched through the bridge. Per-goal
//! single-flight is enforced with `active_goals`; steps of one goal run
//! strictly sequentially while separate goals may overlap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentGoal, AgentState, AgentTrigger, GoalStatus, PlanLifecycle, PlanStep, StepStatus,
    TriggerType,
};
use crate::domain::ports::oracle::Oracle;
use crate::services::agent_manager::AgentManager;
use crate::services::bridge::Bridge;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};
use crate::services::goal_manager::{GoalManager, StepPatch};
use crate::services::lenient_json;
use crate::services::preference_manager::PreferenceManager;
use crate::services::task_manager::TaskManager;
use crate::services::workspace::WorkspaceRegistry;

/// Retries allowed per step beyond the first attempt.
const MAX_RETRIES: u32 = 2;
/// Recon reports are truncated to this many characters in prompts.
const RECON_EXCERPT_LIMIT: usize = 3000;
/// Worker output is truncated to this many characters in prompts.
const OUTPUT_EXCERPT_LIMIT: usize = 4000;

static NEEDS_INPUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[NEEDS_INPUT\]:\s*(.+?)\s*$").unwrap());
static USED_PREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[Used preference:\s*([^\]]+)\]").unwrap());

#[derive(Debug, Clone, Copy)]
struct StepRef {
    goal_id: Uuid,
    step_id: Uuid,
}

#[derive(Default)]
struct AdversaryState {
    /// Goals with a loop iteration in flight (or blocked on a reply).
    active_goals: HashSet<Uuid>,
    /// Correlates step-execution tasks back to their step.
    step_task_map: HashMap<Uuid, StepRef>,
    /// Correlates recon tasks back to their goal.
    recon_task_map: HashMap<Uuid, Uuid>,
    /// Most recent recon report per goal.
    recon_results: HashMap<Uuid, String>,
    /// Retry count per step.
    retry_map: HashMap<Uuid, u32>,
}

pub struct Adversary {
    oracle: Arc<dyn Oracle>,
    bridge: Arc<Bridge>,
    agents: Arc<AgentManager>,
    goals: Arc<GoalManager>,
    tasks: Arc<TaskManager>,
    preferences: Arc<PreferenceManager>,
    workspace: Arc<WorkspaceRegistry>,
    bus: Arc<EventBus>,
    state: Mutex<AdversaryState>,
}

impl Adversary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oracle: Arc<dyn Oracle>,
        bridge: Arc<Bridge>,
        agents: Arc<AgentManager>,
        goals: Arc<GoalManager>,
        tasks: Arc<TaskManager>,
        preferences: Arc<PreferenceManager>,
        workspace: Arc<WorkspaceRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            oracle,
            bridge,
            agents,
            goals,
            tasks,
            preferences,
            workspace,
            bus,
            state: Mutex::new(AdversaryState::default()),
        }
    }

    /// Listen for settled sessions. Each correlated `session_ended` is
    /// handled in its own task so goals never block each other.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let adversary = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let EnginePayload::SessionEnded {
                            task_id,
                            status,
                            result,
                            ..
                        } = event.payload
                        {
                            let adversary = adversary.clone();
                            tokio::spawn(async move {
                                adversary
                                    .on_session_ended(task_id, status == "completed", result)
                                    .await;
                            });
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "adversary lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Begin (or continue) working a goal. Paused goals resume; a goal
    /// already in flight, a busy agent, or a blocked step make this a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn wake(&self, goal_id: Uuid) -> DomainResult<()> {
        let Some(mut goal) = self.goals.get_goal(goal_id).await else {
            return Err(DomainError::GoalNotFound(goal_id));
        };

        if goal.status == GoalStatus::Paused {
            self.goals.update_goal_status(goal_id, GoalStatus::Active).await?;
            goal.status = GoalStatus::Active;
        }
        if goal.status != GoalStatus::Active {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if state.active_goals.contains(&goal_id) {
                return Ok(());
            }
            if self.bridge.is_busy(goal.agent_id).await {
                return Ok(());
            }
            state.active_goals.insert(goal_id);
        }

        if self.goals.get_blocked_step(goal_id).await.is_some() {
            // Waiting on the operator; reply() picks the goal back up.
            return Ok(());
        }

        if self.goals.get_next_pending_step(goal_id).await.is_some() {
            self.execute_next_step(goal_id).await;
        } else {
            self.begin_recon(&goal).await;
        }
        Ok(())
    }

    /// Pause a goal and drop it from the in-flight set. A running step
    /// is not preempted; its outcome is discarded when it settles.
    #[instrument(skip(self))]
    pub async fn pause(&self, goal_id: Uuid) -> DomainResult<()> {
        self.goals.update_goal_status(goal_id, GoalStatus::Paused).await?;
        self.state.lock().await.active_goals.remove(&goal_id);
        Ok(())
    }

    /// Answer a blocked step. Preference extraction runs in the
    /// background; the step is rewritten around the answer and
    /// re-dispatched.
    #[instrument(skip(self, answer))]
    pub async fn reply(&self, goal_id: Uuid, answer: &str) -> DomainResult<()> {
        let goal = self
            .goals
            .get_goal(goal_id)
            .await
            .ok_or(DomainError::GoalNotFound(goal_id))?;
        let Some(step) = self.goals.get_blocked_step(goal_id).await else {
            return Err(DomainError::ValidationFailed(
                "no blocked step awaiting a reply".to_string(),
            ));
        };
        let question = step.question.clone().unwrap_or_default();

        self.spawn_preference_extraction(goal.agent_id, question.clone(), answer.to_string());

        self.goals
            .update_plan_step(
                goal_id,
                step.id,
                StepPatch::status(StepStatus::InProgress).without_question(),
            )
            .await?;
        self.state.lock().await.active_goals.insert(goal_id);

        let prompt = resume_instruction_prompt(&step.description, &question, answer);
        let reply = self.oracle.complete(None, &prompt).await;
        if reply.is_err() || reply.content.trim().is_empty() {
            self.fail_goal(goal_id, "oracle unavailable while resuming a blocked step")
                .await;
            return Err(DomainError::Oracle(
                reply.error.unwrap_or_else(|| "empty completion".to_string()),
            ));
        }

        self.dispatch_step(&goal, &step, reply.content.trim().to_string())
            .await;
        Ok(())
    }

    /// Out-of-band conversation with an agent; no worker involved.
    pub async fn talk(
        &self,
        agent_id: Uuid,
        message: &str,
        activity_summary: Option<&str>,
    ) -> DomainResult<String> {
        let agent = self
            .agents
            .get(agent_id)
            .await
            .ok_or(DomainError::AgentNotFound(agent_id))?;

        let goal = self.goals.active_goal_for_agent(agent_id).await;
        let plan_summary = match &goal {
            Some(goal) => match self.goals.get_current_plan(goal.id).await {
                Some(plan) => plan
                    .steps
                    .iter()
                    .map(|s| format!("{}. [{}] {}", s.order + 1, s.status.as_str(), s.description))
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => "No plan yet.".to_string(),
            },
            None => String::new(),
        };

        let prompt = talk_prompt(
            &agent.name,
            goal.as_ref().map(|g| g.description.as_str()),
            &plan_summary,
            activity_summary,
            message,
        );

        let reply = self.oracle.complete(agent.system_prompt.as_deref(), &prompt).await;
        match reply.error {
            Some(error) => Err(DomainError::Oracle(error)),
            None => Ok(reply.content),
        }
    }

    /// Whether the adversary currently has the goal in flight.
    pub async fn is_goal_active(&self, goal_id: Uuid) -> bool {
        self.state.lock().await.active_goals.contains(&goal_id)
    }

    // ------------------------------------------------------------------
    // Recon
    // ------------------------------------------------------------------

    async fn begin_recon(&self, goal: &AgentGoal) {
        let Some(agent) = self.agents.get(goal.agent_id).await else {
            self.release_goal(goal.id).await;
            return;
        };

        let task = self
            .tasks
            .create_task(format!("Recon: {}", goal.description), Some(goal.agent_id))
            .await;
        self.state.lock().await.recon_task_map.insert(task.id, goal.id);

        let prompt = recon_instruction(&agent.name, goal);
        if let Err(e) = self
            .bridge
            .dispatch_worker(
                goal.agent_id,
                task.id,
                Some(goal.max_turns_per_step),
                goal.working_directory.clone(),
                prompt,
            )
            .await
        {
            tracing::warn!(goal_id = %goal.id, error = %e, "recon dispatch failed");
            self.state.lock().await.recon_task_map.remove(&task.id);
            // Degraded path: plan without a recon report.
            self.plan_goal(goal.id, Vec::new()).await;
        }
    }

    async fn after_recon(&self, goal_id: Uuid, ok: bool, result: String) {
        if ok && !result.trim().is_empty() {
            self.state
                .lock()
                .await
                .recon_results
                .insert(goal_id, result);
        } else {
            tracing::warn!(goal_id = %goal_id, "recon failed, planning without a report");
        }
        self.plan_goal(goal_id, Vec::new()).await;
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    async fn plan_goal(&self, goal_id: Uuid, prior: Vec<(String, String)>) {
        let Some(goal) = self.goals.get_goal(goal_id).await else {
            self.release_goal(goal_id).await;
            return;
        };
        if goal.status != GoalStatus::Active {
            self.release_goal(goal_id).await;
            return;
        }
        let Some(agent) = self.agents.get(goal.agent_id).await else {
            self.release_goal(goal_id).await;
            return;
        };

        let recon = self.state.lock().await.recon_results.get(&goal_id).cloned();
        let preference_context = self.preferences.build_preference_context(goal.agent_id).await;
        let roots = self.workspace.roots().await;

        let prompt = planning_prompt(
            &goal,
            &agent.name,
            recon.as_deref(),
            &prior,
            &preference_context,
            &roots,
        );

        let _ = self.agents.update_state(goal.agent_id, AgentState::Thinking).await;
        let reply = self.oracle.complete(goal.system_prompt.as_deref(), &prompt).await;
        let _ = self.agents.update_state(goal.agent_id, AgentState::Idle).await;

        if let Some(error) = reply.error {
            self.publish_oracle_error("planning", &error);
            self.fail_goal(goal_id, "oracle hard-failure during planning").await;
            return;
        }

        let Some(parsed) = parse_plan(&reply.content) else {
            self.fail_goal(goal_id, "unparseable plan from oracle").await;
            return;
        };
        if parsed.steps.is_empty() {
            self.fail_goal(goal_id, "oracle produced an empty plan").await;
            return;
        }

        let lifecycle = parsed.lifecycle.clone();
        match self
            .goals
            .set_plan(goal_id, parsed.steps, parsed.reasoning, parsed.lifecycle)
            .await
        {
            Ok(_) => {
                self.ensure_recurring_trigger(&goal, &lifecycle).await;
                self.execute_next_step(goal_id).await;
            }
            Err(e) => {
                tracing::error!(goal_id = %goal_id, error = %e, "failed to store plan");
                self.fail_goal(goal_id, "failed to store plan").await;
            }
        }
    }

    /// A recurring plan with an interval keeps itself alive through an
    /// interval trigger.
    async fn ensure_recurring_trigger(&self, goal: &AgentGoal, lifecycle: &PlanLifecycle) {
        if !lifecycle.recurring {
            return;
        }
        let Some(minutes) = lifecycle.interval_minutes else {
            return;
        };
        let existing = self.goals.triggers_for_goal(goal.id).await;
        if existing.iter().any(|t| t.trigger_type == TriggerType::Interval) {
            return;
        }
        self.goals
            .add_trigger(AgentTrigger::interval(
                goal.agent_id,
                goal.id,
                u64::from(minutes) * 60_000,
            ))
            .await;
    }

    // ------------------------------------------------------------------
    // Step execution
    // ------------------------------------------------------------------

    async fn execute_next_step(&self, goal_id: Uuid) {
        let Some(goal) = self.goals.get_goal(goal_id).await else {
            self.release_goal(goal_id).await;
            return;
        };
        if goal.status != GoalStatus::Active {
            self.release_goal(goal_id).await;
            return;
        }
        let Some(step) = self.goals.get_next_pending_step(goal_id).await else {
            self.finish_goal_cycle(goal_id).await;
            return;
        };

        let prior = self.completed_results(goal_id).await;
        let prompt = craft_instruction_prompt(&goal, &step, &prior);

        let _ = self.agents.update_state(goal.agent_id, AgentState::Thinking).await;
        let reply = self.oracle.complete(None, &prompt).await;
        let _ = self.agents.update_state(goal.agent_id, AgentState::Idle).await;

        if reply.is_err() || reply.content.trim().is_empty() {
            self.publish_oracle_error(
                "crafting step instruction",
                reply.error.as_deref().unwrap_or("empty completion"),
            );
            self.fail_goal(goal_id, "oracle unavailable while crafting a step instruction")
                .await;
            return;
        }

        self.dispatch_step(&goal, &step, reply.content.trim().to_string())
            .await;
    }

    /// Dispatch one step with an already-crafted instruction.
    async fn dispatch_step(&self, goal: &AgentGoal, step: &PlanStep, instruction: String) {
        let Some(agent) = self.agents.get(goal.agent_id).await else {
            self.release_goal(goal.id).await;
            return;
        };

        let task = self
            .tasks
            .create_task(
                format!("Step {}: {}", step.order + 1, step.description),
                Some(goal.agent_id),
            )
            .await;

        if let Err(e) = self
            .goals
            .update_plan_step(
                goal.id,
                step.id,
                StepPatch::status(StepStatus::InProgress)
                    .with_task(task.id)
                    .without_question(),
            )
            .await
        {
            tracing::error!(goal_id = %goal.id, error = %e, "failed to mark step in progress");
            self.release_goal(goal.id).await;
            return;
        }
        self.state.lock().await.step_task_map.insert(
            task.id,
            StepRef {
                goal_id: goal.id,
                step_id: step.id,
            },
        );

        let prior = self.completed_results(goal.id).await;
        let prompt = self
            .bridge
            .compose_worker_prompt(&agent, goal, &instruction, &prior)
            .await;

        if let Err(e) = self
            .bridge
            .dispatch_worker(
                goal.agent_id,
                task.id,
                Some(goal.max_turns_per_step),
                goal.working_directory.clone(),
                prompt,
            )
            .await
        {
            tracing::warn!(goal_id = %goal.id, step_id = %step.id, error = %e, "step dispatch failed");
            self.state.lock().await.step_task_map.remove(&task.id);
            match e {
                DomainError::AgentBusy(_) => {
                    // Leave the step for the next wake.
                    let _ = self
                        .goals
                        .update_plan_step(goal.id, step.id, StepPatch::status(StepStatus::Pending))
                        .await;
                    self.release_goal(goal.id).await;
                }
                _ => {
                    let _ = self
                        .goals
                        .update_plan_step(
                            goal.id,
                            step.id,
                            StepPatch::status(StepStatus::Failed)
                                .with_result(format!("dispatch failed: {e}")),
                        )
                        .await;
                    self.finish_goal_cycle(goal.id).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Session settlement
    // ------------------------------------------------------------------

    async fn on_session_ended(&self, task_id: Uuid, ok: bool, result: String) {
        let (step_ref, recon_goal) = {
            let mut state = self.state.lock().await;
            (
                state.step_task_map.remove(&task_id),
                state.recon_task_map.remove(&task_id),
            )
        };

        if let Some(goal_id) = recon_goal {
            self.after_recon(goal_id, ok, result).await;
        } else if let Some(step_ref) = step_ref {
            self.after_step(step_ref, ok, result).await;
        }
    }

    async fn after_step(&self, r: StepRef, ok: bool, result: String) {
        let Some(goal) = self.goals.get_goal(r.goal_id).await else {
            self.release_goal(r.goal_id).await;
            return;
        };
        if goal.status != GoalStatus::Active {
            self.release_goal(r.goal_id).await;
            return;
        }

        if !ok {
            let message = if result.is_empty() {
                "worker session ended in error".to_string()
            } else {
                result
            };
            let _ = self
                .goals
                .update_plan_step(
                    r.goal_id,
                    r.step_id,
                    StepPatch::status(StepStatus::Failed).with_result(message),
                )
                .await;
            self.finish_goal_cycle(r.goal_id).await;
            return;
        }

        // The worker can punt to the operator instead of finishing.
        if let Some(question) = needs_input(&result) {
            self.auto_answer_or_escalate(&goal, r, question).await;
            return;
        }

        for key in used_preference_keys(&result) {
            self.preferences.increment_usage(goal.agent_id, &key).await;
        }

        let Some(step) = self.step_snapshot(r).await else {
            self.release_goal(r.goal_id).await;
            return;
        };

        let prompt = evaluation_prompt(&goal, &step, &result);
        let _ = self.agents.update_state(goal.agent_id, AgentState::Thinking).await;
        let reply = self.oracle.complete(None, &prompt).await;
        let _ = self.agents.update_state(goal.agent_id, AgentState::Idle).await;

        // An unreadable verdict defaults to PASS so one flaky
        // evaluation cannot loop a goal forever.
        let verdict = parse_verdict(&reply.content);
        match verdict.kind {
            VerdictKind::Pass => {
                let _ = self
                    .goals
                    .update_plan_step(
                        r.goal_id,
                        r.step_id,
                        StepPatch::status(StepStatus::Completed).with_result(result),
                    )
                    .await;
                let _ = self.agents.increment_tasks_completed(goal.agent_id).await;
                self.state.lock().await.retry_map.remove(&r.step_id);
                self.refine_plan(r.goal_id).await;
                self.continue_goal(r.goal_id).await;
            }
            VerdictKind::Retry => {
                let attempts = {
                    let mut state = self.state.lock().await;
                    let entry = state.retry_map.entry(r.step_id).or_insert(0);
                    *entry
                };
                if attempts < MAX_RETRIES {
                    self.state
                        .lock()
                        .await
                        .retry_map
                        .insert(r.step_id, attempts + 1);
                    let _ = self
                        .goals
                        .update_plan_step(r.goal_id, r.step_id, StepPatch::status(StepStatus::Pending))
                        .await;
                    let instruction = verdict
                        .refined_instruction
                        .unwrap_or_else(|| step.description.clone());
                    self.dispatch_step(&goal, &step, instruction).await;
                } else {
                    let question = verdict.escalation_question.unwrap_or_else(|| {
                        format!(
                            "Step \"{}\" keeps failing evaluation. How should I proceed?",
                            step.description
                        )
                    });
                    self.auto_answer_or_escalate(&goal, r, question).await;
                }
            }
            VerdictKind::Escalate => {
                let question = verdict.escalation_question.unwrap_or_else(|| {
                    format!(
                        "Step \"{}\" needs an operator decision. How should I proceed?",
                        step.description
                    )
                });
                self.auto_answer_or_escalate(&goal, r, question).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Auto-answer or escalate
    // ------------------------------------------------------------------

    async fn auto_answer_or_escalate(&self, goal: &AgentGoal, r: StepRef, question: String) {
        let recon = self.state.lock().await.recon_results.get(&goal.id).cloned();
        let preference_context = self.preferences.build_preference_context(goal.agent_id).await;
        let prompt = auto_answer_prompt(goal, recon.as_deref(), &preference_context, &question);

        let reply = self.oracle.complete(None, &prompt).await;
        if let Some(ref error) = reply.error {
            self.publish_oracle_error("auto-answer", error);
        }
        let answer = parse_auto_answer(&reply.content);

        match answer {
            Some(answer) => {
                let Some(step) = self.step_snapshot(r).await else {
                    self.release_goal(r.goal_id).await;
                    return;
                };
                let prompt = resume_instruction_prompt(&step.description, &question, &answer);
                let crafted = self.oracle.complete(None, &prompt).await;
                if crafted.is_err() || crafted.content.trim().is_empty() {
                    self.fail_goal(r.goal_id, "oracle unavailable while resuming a step")
                        .await;
                    return;
                }
                let _ = self
                    .goals
                    .update_plan_step(
                        r.goal_id,
                        r.step_id,
                        StepPatch::status(StepStatus::InProgress).without_question(),
                    )
                    .await;
                self.dispatch_step(goal, &step, crafted.content.trim().to_string())
                    .await;
            }
            None => {
                let _ = self
                    .goals
                    .update_plan_step(
                        r.goal_id,
                        r.step_id,
                        StepPatch::status(StepStatus::Blocked).with_question(question.clone()),
                    )
                    .await;
                self.bus.publish(
                    EngineEvent::new(EnginePayload::QuestionRaised {
                        goal_id: r.goal_id,
                        step_id: r.step_id,
                        agent_id: goal.agent_id,
                        question,
                    })
                    .with_agent(goal.agent_id)
                    .with_goal(r.goal_id),
                );
                // The goal stays in active_goals until reply() or pause().
            }
        }
    }

    /// Background preference extraction; failures are logged, never
    /// awaited by the caller.
    fn spawn_preference_extraction(&self, agent_id: Uuid, question: String, answer: String) {
        let preferences = self.preferences.clone();
        let oracle = self.oracle.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let prompt = preferences
                .build_extraction_prompt(
                    agent_id,
                    &answer,
                    &question,
                    "operator reply to a blocked step",
                )
                .await;
            let reply = oracle.complete(None, &prompt).await;
            if let Some(error) = reply.error {
                bus.publish(EngineEvent::new(EnginePayload::OracleError {
                    context: "preference extraction".to_string(),
                    error,
                }));
                return;
            }
            let stored = preferences
                .parse_and_store_extraction(agent_id, &reply.content, "reply")
                .await;
            tracing::debug!(agent_id = %agent_id, stored, "preference extraction finished");
        });
    }

    // ------------------------------------------------------------------
    // Refinement and completion
    // ------------------------------------------------------------------

    /// After a PASS, let the oracle rewrite the remaining pending steps
    /// in light of what was learned. `"SKIP"` retires a step.
    async fn refine_plan(&self, goal_id: Uuid) {
        let Some(plan) = self.goals.get_current_plan(goal_id).await else {
            return;
        };
        let completed: Vec<&PlanStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        let pending: Vec<&PlanStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect();
        if completed.is_empty() || pending.is_empty() {
            return;
        }

        let prompt = refinement_prompt(&completed, &pending);
        let reply = self.oracle.complete(None, &prompt).await;
        let Some(refinements) = parse_refinement(&reply.content) else {
            return;
        };

        for (order, description) in refinements {
            let Some(step) = pending.iter().find(|s| s.order == order) else {
                continue;
            };
            if description.trim() == "SKIP" {
                let _ = self
                    .goals
                    .update_plan_step(goal_id, step.id, StepPatch::status(StepStatus::Skipped))
                    .await;
            } else if description.trim() != step.description {
                let _ = self
                    .goals
                    .update_plan_step(goal_id, step.id, StepPatch::description(description.trim()))
                    .await;
            }
        }
    }

    async fn continue_goal(&self, goal_id: Uuid) {
        if self.goals.get_next_pending_step(goal_id).await.is_some() {
            self.execute_next_step(goal_id).await;
        } else {
            self.finish_goal_cycle(goal_id).await;
        }
    }

    /// Decide what happens when no pending step remains.
    async fn finish_goal_cycle(&self, goal_id: Uuid) {
        let Some(plan) = self.goals.get_current_plan(goal_id).await else {
            self.release_goal(goal_id).await;
            return;
        };

        if plan.blocked_step().is_some() {
            // Waiting on the operator.
            return;
        }
        if plan.next_pending_step().is_some() {
            // Boxed: this loop re-enters itself through execute/dispatch.
            Box::pin(self.execute_next_step(goal_id)).await;
            return;
        }

        if plan.is_finished() {
            if plan.recurring {
                // Leave the goal active; its trigger starts a new cycle.
                self.release_goal(goal_id).await;
            } else {
                let _ = self
                    .goals
                    .update_goal_status(goal_id, GoalStatus::Completed)
                    .await;
                self.release_goal(goal_id).await;
            }
        } else if plan.has_failed_step() {
            // Re-plan, carrying forward what the completed steps learned.
            let prior = self.completed_results(goal_id).await;
            Box::pin(self.plan_goal(goal_id, prior)).await;
        } else {
            self.release_goal(goal_id).await;
        }
    }

    async fn fail_goal(&self, goal_id: Uuid, reason: &str) {
        tracing::error!(goal_id = %goal_id, reason, "goal failed");
        let _ = self.goals.update_goal_status(goal_id, GoalStatus::Failed).await;
        let mut state = self.state.lock().await;
        state.active_goals.remove(&goal_id);
        state.recon_results.remove(&goal_id);
    }

    async fn release_goal(&self, goal_id: Uuid) {
        self.state.lock().await.active_goals.remove(&goal_id);
    }

    async fn completed_results(&self, goal_id: Uuid) -> Vec<(String, String)> {
        let Some(plan) = self.goals.get_current_plan(goal_id).await else {
            return Vec::new();
        };
        plan.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| {
                (
                    s.description.clone(),
                    s.result.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    async fn step_snapshot(&self, r: StepRef) -> Option<PlanStep> {
        self.goals
            .get_current_plan(r.goal_id)
            .await
            .and_then(|plan| plan.step(r.step_id).cloned())
    }

    fn publish_oracle_error(&self, context: &str, error: &str) {
        self.bus.publish(EngineEvent::new(EnginePayload::OracleError {
            context: context.to_string(),
            error: error.to_string(),
        }));
    }
}

// ----------------------------------------------------------------------
// Output scanning
// ----------------------------------------------------------------------

/// The worker's question when its output ends with `[NEEDS_INPUT]: …`.
fn needs_input(result: &str) -> Option<String> {
    NEEDS_INPUT_RE
        .captures(result.trim_end())
        .map(|caps| caps[1].trim().to_string())
        .filter(|q| !q.is_empty())
}

/// Every `[Used preference: KEY]` marker in the worker output.
fn used_preference_keys(result: &str) -> Vec<String> {
    USED_PREF_RE
        .captures_iter(result)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

// ----------------------------------------------------------------------
// Oracle reply parsing
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ParsedPlan {
    reasoning: String,
    steps: Vec<String>,
    lifecycle: PlanLifecycle,
}

/// Parse a planning reply. Accepts the full object form or a bare array
/// of step descriptions.
fn parse_plan(text: &str) -> Option<ParsedPlan> {
    let value = lenient_json::extract_value(text)?;

    match value {
        Value::Array(items) => {
            let steps = step_descriptions(&items);
            (!steps.is_empty()).then(|| ParsedPlan {
                reasoning: String::new(),
                steps,
                lifecycle: PlanLifecycle::default(),
            })
        }
        Value::Object(map) => {
            let steps = map
                .get("steps")
                .and_then(Value::as_array)
                .map(|items| step_descriptions(items))
                .unwrap_or_default();
            if steps.is_empty() {
                return None;
            }
            Some(ParsedPlan {
                reasoning: map
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                steps,
                lifecycle: PlanLifecycle {
                    recurring: map.get("recurring").and_then(Value::as_bool).unwrap_or(false),
                    interval_minutes: map
                        .get("interval_minutes")
                        .and_then(Value::as_u64)
                        .map(|m| m as u32),
                    cycle_goal: map
                        .get("cycle_goal")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    completion_criteria: map
                        .get("completion_criteria")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            })
        }
        _ => None,
    }
}

fn step_descriptions(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.clone()),
            Value::Object(map) => map
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerdictKind {
    Pass,
    Retry,
    Escalate,
}

#[derive(Debug, Clone)]
struct Verdict {
    kind: VerdictKind,
    refined_instruction: Option<String>,
    escalation_question: Option<String>,
}

/// Parse an evaluation verdict; anything unreadable is a PASS.
fn parse_verdict(text: &str) -> Verdict {
    let fallback = Verdict {
        kind: VerdictKind::Pass,
        refined_instruction: None,
        escalation_question: None,
    };
    let Some(value) = lenient_json::extract_object(text) else {
        return fallback;
    };
    let kind = match value
        .get("verdict")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("RETRY") => VerdictKind::Retry,
        Some("ESCALATE") => VerdictKind::Escalate,
        _ => VerdictKind::Pass,
    };
    Verdict {
        kind,
        refined_instruction: value
            .get("refined_instruction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty()),
        escalation_question: value
            .get("escalation_question")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty()),
    }
}

/// The auto-answer when the oracle can answer the worker's question.
fn parse_auto_answer(text: &str) -> Option<String> {
    let value = lenient_json::extract_object(text)?;
    if value.get("can_answer").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    value
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Refined `(order, description)` pairs, or None when no refinement.
fn parse_refinement(text: &str) -> Option<Vec<(u32, String)>> {
    let value = lenient_json::extract_object(text)?;
    if value.get("needs_refinement").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let items = value.get("refined_steps").and_then(Value::as_array)?;
    Some(
        items
            .iter()
            .filter_map(|item| {
                let order = item.get("order").and_then(Value::as_u64)? as u32;
                let description = item.get("description").and_then(Value::as_str)?;
                Some((order, description.to_string()))
            })
            .collect(),
    )
}

// ----------------------------------------------------------------------
// Prompts
// ----------------------------------------------------------------------

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}\n[... truncated]")
    }
}

fn recon_instruction(agent_name: &str, goal: &AgentGoal) -> String {
    format!(
        r#"You are {agent_name}, performing reconnaissance before any work begins.

## Goal you are preparing for
{goal}

Explore the working tree at {dir}. Identify the project layout, the
language and framework in use, the key files, the current state of the
code, and anything relevant to the goal above. Do not modify anything.

Write a concise human-readable report, then end it with exactly this
structured block:

<recon_summary>
PROJECT_PATH: <absolute path>
LANGUAGE: <primary language>
FRAMEWORK: <framework or "none">
KEY_FILES: <comma-separated paths>
CURRENT_STATE: <one or two sentences>
IMPROVEMENT_OPPORTUNITIES: <one or two sentences>
</recon_summary>"#,
        agent_name = agent_name,
        goal = goal.description,
        dir = goal.working_directory.display(),
    )
}

fn planning_prompt(
    goal: &AgentGoal,
    agent_name: &str,
    recon: Option<&str>,
    prior: &[(String, String)],
    preference_context: &str,
    roots: &[std::path::PathBuf],
) -> String {
    let constraints = if goal.constraints.is_empty() {
        "None specified".to_string()
    } else {
        goal.constraints
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let recon = recon
        .map(|r| truncate_chars(r, RECON_EXCERPT_LIMIT))
        .unwrap_or_else(|| "No reconnaissance report available.".to_string());

    let prior = if prior.is_empty() {
        "This is the first plan for this goal.".to_string()
    } else {
        prior
            .iter()
            .map(|(description, result)| {
                format!(
                    "- {description}: {}",
                    truncate_chars(result, 400)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let roots = if roots.is_empty() {
        "None configured".to_string()
    } else {
        roots
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let preferences = if preference_context.is_empty() {
        "None recorded".to_string()
    } else {
        preference_context.to_string()
    };

    format!(
        r#"You are the planner behind the agent "{agent_name}".

## Goal
{goal}

## Working directory
{dir} (workspace roots: {roots})

## Constraints
{constraints}

## Reconnaissance report
{recon}

## Results from previous steps
{prior}

## Operator preferences
{preferences}

## Instructions
Produce a linear plan of 2-6 concrete steps, each achievable by one
tool-equipped worker session. Steps run strictly in order; a step cannot
see the worker transcript of earlier steps, only their recorded results.
Decide whether the goal is a one-shot effort or recurring maintenance.

## Required output format (JSON)
{{
  "reasoning": "why the plan is shaped this way",
  "recurring": true|false,
  "interval_minutes": <minutes between cycles, when recurring>,
  "cycle_goal": "what each cycle should accomplish, when recurring",
  "completion_criteria": "how to tell the goal is done",
  "steps": [
    {{"description": "first step"}},
    {{"description": "second step"}}
  ]
}}

IMPORTANT: Output ONLY the JSON object, no other text."#,
        agent_name = agent_name,
        goal = goal.description,
        dir = goal.working_directory.display(),
        roots = roots,
        constraints = constraints,
        recon = recon,
        prior = prior,
        preferences = preferences,
    )
}

fn craft_instruction_prompt(
    goal: &AgentGoal,
    step: &PlanStep,
    prior: &[(String, String)],
) -> String {
    let prior = if prior.is_empty() {
        "No steps have completed yet.".to_string()
    } else {
        prior
            .iter()
            .map(|(description, result)| {
                format!("- {description}: {}", truncate_chars(result, 600))
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You orchestrate worker sessions for the goal:
{goal}

The next plan step is:
{step}

Results of completed steps (workers share no other memory):
{prior}

Write a self-contained instruction for a fresh worker session that
executes this step. Fold in whatever the completed steps learned that
the worker needs; it cannot see anything else. Be specific about files,
commands, and the definition of done.

Output ONLY the instruction text, no preamble."#,
        goal = goal.description,
        step = step.description,
        prior = prior,
    )
}

fn evaluation_prompt(goal: &AgentGoal, step: &PlanStep, result: &str) -> String {
    format!(
        r#"You are evaluating a worker's output for one plan step.

## Goal
{goal}

## Step
{step}

## Worker output
{result}

## Instructions
Decide whether the step is done. PASS when the output shows the step's
intent was accomplished. RETRY when the attempt went wrong in a way a
refined instruction could fix. ESCALATE when an operator decision is
required.

## Required output format (JSON)
{{
  "verdict": "PASS|RETRY|ESCALATE",
  "reasoning": "one or two sentences",
  "refined_instruction": "sharper instruction, when RETRY",
  "escalation_question": "the question for the operator, when ESCALATE"
}}

IMPORTANT: Output ONLY the JSON object, no other text."#,
        goal = goal.description,
        step = step.description,
        result = truncate_chars(result, OUTPUT_EXCERPT_LIMIT),
    )
}

fn auto_answer_prompt(
    goal: &AgentGoal,
    recon: Option<&str>,
    preference_context: &str,
    question: &str,
) -> String {
    let constraints = if goal.constraints.is_empty() {
        "None".to_string()
    } else {
        goal.constraints.join("; ")
    };
    let recon = recon
        .map(|r| truncate_chars(r, RECON_EXCERPT_LIMIT))
        .unwrap_or_else(|| "None".to_string());
    let preferences = if preference_context.is_empty() {
        "None recorded".to_string()
    } else {
        preference_context.to_string()
    };

    format!(
        r#"A worker paused with a question. Decide whether it can be
answered from what is already known, before bothering the operator.

## Goal
{goal}

## Constraints
{constraints}

## Reconnaissance
{recon}

## Operator preferences
{preferences}

## The worker's question
{question}

Answer ONLY when the goal, constraints, reconnaissance, or preferences
clearly determine the answer. Guessing on matters of operator intent is
worse than asking.

## Required output format (JSON)
{{
  "can_answer": true|false,
  "answer": "the answer, when can_answer is true",
  "reasoning": "one sentence"
}}

IMPORTANT: Output ONLY the JSON object, no other text."#,
        goal = goal.description,
        constraints = constraints,
        recon = recon,
        preferences = preferences,
        question = question,
    )
}

fn resume_instruction_prompt(step_description: &str, question: &str, answer: &str) -> String {
    format!(
        r#"A plan step was paused on a question that now has an answer.

## Original step
{step}

## Question
{question}

## Answer
{answer}

Rewrite the step as a complete worker instruction that incorporates the
answer as settled fact. Do not merely append the answer; fold it into
the instruction so the worker never re-asks. Output ONLY the rewritten
instruction text."#,
        step = step_description,
        question = question,
        answer = answer,
    )
}

fn refinement_prompt(completed: &[&PlanStep], pending: &[&PlanStep]) -> String {
    let completed = completed
        .iter()
        .map(|s| {
            format!(
                "- (done) {}: {}",
                s.description,
                truncate_chars(s.result.as_deref().unwrap_or(""), 400)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let pending = pending
        .iter()
        .map(|s| format!("- order {}: {}", s.order, s.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"A plan is mid-flight. Given what the completed steps learned,
decide whether the remaining steps should be rewritten.

## Completed steps
{completed}

## Remaining steps
{pending}

Rewrite a remaining step only when its current description no longer
fits what was learned. Use the exact description "SKIP" to drop a step
that has become unnecessary.

## Required output format (JSON)
{{
  "needs_refinement": true|false,
  "reasoning": "one sentence",
  "refined_steps": [
    {{"order": <order of a remaining step>, "description": "new description or SKIP"}}
  ]
}}

IMPORTANT: Output ONLY the JSON object, no other text."#,
        completed = completed,
        pending = pending,
    )
}

fn talk_prompt(
    agent_name: &str,
    goal: Option<&str>,
    plan_summary: &str,
    activity_summary: Option<&str>,
    message: &str,
) -> String {
    let context = match goal {
        Some(goal) => format!("Current goal: {goal}\nPlan status:\n{plan_summary}"),
        None => "No active goal right now.".to_string(),
    };
    let activity = activity_summary
        .map(|s| format!("\nRecent activity: {s}"))
        .unwrap_or_default();

    format!(
        r#"You are {agent_name}, an autonomous agent, chatting with your
operator between tasks. Answer plainly and concretely.

{context}{activity}

Operator: {message}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_input_at_tail() {
        let output = "I did some work.\n<step_summary>ok</step_summary>\n[NEEDS_INPUT]: Which DB driver?";
        assert_eq!(needs_input(output).as_deref(), Some("Which DB driver?"));

        assert!(needs_input("all done, no questions").is_none());
        assert!(needs_input("[NEEDS_INPUT]:   ").is_none());
    }

    #[test]
    fn test_needs_input_spans_lines() {
        let output = "work\n[NEEDS_INPUT]: Should I use\nthe staging database?";
        let question = needs_input(output).unwrap();
        assert!(question.contains("staging database"));
    }

    #[test]
    fn test_used_preference_keys() {
        let output = "Applied settings.\n[Used preference: db_driver]\nmore\n[Used preference: commit_style]";
        assert_eq!(used_preference_keys(output), vec!["db_driver", "commit_style"]);
        assert!(used_preference_keys("nothing here").is_empty());
    }

    #[test]
    fn test_parse_plan_object_form() {
        let text = r#"Here you go:
```json
{
  "reasoning": "profile first",
  "recurring": true,
  "interval_minutes": 30,
  "cycle_goal": "keep queries fast",
  "completion_criteria": "p95 under 100ms",
  "steps": [{"description": "profile"}, {"description": "fix N+1"}]
}
```"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.reasoning, "profile first");
        assert_eq!(plan.steps, vec!["profile".to_string(), "fix N+1".to_string()]);
        assert!(plan.lifecycle.recurring);
        assert_eq!(plan.lifecycle.interval_minutes, Some(30));
    }

    #[test]
    fn test_parse_plan_bare_array() {
        let plan = parse_plan(r#"["profile", "fix N+1"]"#).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(!plan.lifecycle.recurring);

        let plan = parse_plan(r#"[{"description": "a"}, {"description": "b"}]"#).unwrap();
        assert_eq!(plan.steps, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_plan_rejects_garbage() {
        assert!(parse_plan("I could not produce a plan, sorry.").is_none());
        assert!(parse_plan(r#"{"reasoning": "no steps"}"#).is_none());
        assert!(parse_plan(r#"{"steps": []}"#).is_none());
    }

    #[test]
    fn test_parse_verdict_defaults_to_pass() {
        assert_eq!(parse_verdict("not json at all").kind, VerdictKind::Pass);
        assert_eq!(parse_verdict(r#"{"verdict": "MAYBE"}"#).kind, VerdictKind::Pass);
    }

    #[test]
    fn test_parse_verdict_variants() {
        let verdict = parse_verdict(
            r#"{"verdict": "RETRY", "reasoning": "r", "refined_instruction": "re-check file X"}"#,
        );
        assert_eq!(verdict.kind, VerdictKind::Retry);
        assert_eq!(verdict.refined_instruction.as_deref(), Some("re-check file X"));

        let verdict = parse_verdict(
            r#"{"verdict": "escalate", "escalation_question": "which env?"}"#,
        );
        assert_eq!(verdict.kind, VerdictKind::Escalate);
        assert_eq!(verdict.escalation_question.as_deref(), Some("which env?"));
    }

    #[test]
    fn test_parse_auto_answer() {
        assert_eq!(
            parse_auto_answer(r#"{"can_answer": true, "answer": "Postgres"}"#).as_deref(),
            Some("Postgres")
        );
        assert!(parse_auto_answer(r#"{"can_answer": false, "answer": "Postgres"}"#).is_none());
        assert!(parse_auto_answer(r#"{"can_answer": true, "answer": ""}"#).is_none());
        assert!(parse_auto_answer("garbled").is_none());
    }

    #[test]
    fn test_parse_refinement() {
        let text = r#"{"needs_refinement": true, "reasoning": "r", "refined_steps": [
            {"order": 1, "description": "tighter step"},
            {"order": 2, "description": "SKIP"}
        ]}"#;
        let refinements = parse_refinement(text).unwrap();
        assert_eq!(refinements.len(), 2);
        assert_eq!(refinements[0], (1, "tighter step".to_string()));

        assert!(parse_refinement(r#"{"needs_refinement": false}"#).is_none());
        assert!(parse_refinement("nope").is_none());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "x".repeat(20);
        let cut = truncate_chars(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx"));
        assert!(cut.ends_with("[... truncated]"));
    }
}
