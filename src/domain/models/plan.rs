//! Plan and plan-step domain models.
//!
//! Each goal holds at most one current plan; replacing a plan bumps its
//! version. Steps form a dense, zero-based order and execute strictly
//! sequentially. Invariants: at most one step in progress and at most
//! one blocked step at a time, and a blocked step always carries the
//! question that blocked it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    /// A settled step needs no further work.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// A single unit of work dispatched to a worker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub goal_id: Uuid,
    /// Zero-based position, dense and unique within the plan.
    pub order: u32,
    pub description: String,
    pub status: StepStatus,
    /// Task backing the most recent dispatch of this step.
    pub task_id: Option<Uuid>,
    pub result: Option<String>,
    /// Set iff the step is blocked.
    pub question: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn new(goal_id: Uuid, order: u32, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal_id,
            order,
            description: description.into(),
            status: StepStatus::Pending,
            task_id: None,
            result: None,
            question: None,
            completed_at: None,
        }
    }
}

/// Lifecycle attributes the planner attaches to a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanLifecycle {
    pub recurring: bool,
    pub interval_minutes: Option<u32>,
    pub cycle_goal: Option<String>,
    pub completion_criteria: Option<String>,
}

/// The current versioned plan for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPlan {
    pub id: Uuid,
    pub goal_id: Uuid,
    /// Starts at 1 and increments each time the plan is replaced.
    pub version: u32,
    pub reasoning: String,
    pub steps: Vec<PlanStep>,
    pub recurring: bool,
    pub interval_minutes: Option<u32>,
    pub cycle_goal: Option<String>,
    pub completion_criteria: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentPlan {
    /// Build a plan with dense step orders from a list of descriptions.
    pub fn new(
        goal_id: Uuid,
        version: u32,
        reasoning: impl Into<String>,
        descriptions: Vec<String>,
        lifecycle: PlanLifecycle,
    ) -> Self {
        let now = Utc::now();
        let steps = descriptions
            .into_iter()
            .enumerate()
            .map(|(i, desc)| PlanStep::new(goal_id, i as u32, desc))
            .collect();
        Self {
            id: Uuid::new_v4(),
            goal_id,
            version,
            reasoning: reasoning.into(),
            steps,
            recurring: lifecycle.recurring,
            interval_minutes: lifecycle.interval_minutes,
            cycle_goal: lifecycle.cycle_goal,
            completion_criteria: lifecycle.completion_criteria,
            created_at: now,
            updated_at: now,
        }
    }

    /// The lowest-order step still pending.
    pub fn next_pending_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .min_by_key(|s| s.order)
    }

    /// Any step currently blocked on an operator question.
    pub fn blocked_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Blocked)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// True when every step is completed or skipped.
    pub fn is_finished(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_settled())
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Check the structural invariants of the plan.
    pub fn validate(&self) -> Result<(), String> {
        let mut orders: Vec<u32> = self.steps.iter().map(|s| s.order).collect();
        orders.sort_unstable();
        for (expected, actual) in orders.iter().enumerate() {
            if *actual != expected as u32 {
                return Err(format!(
                    "step orders must be dense [0..{}), found {actual}",
                    self.steps.len()
                ));
            }
        }
        let in_progress = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(format!("{in_progress} steps in progress, at most one allowed"));
        }
        let blocked: Vec<&PlanStep> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Blocked)
            .collect();
        if blocked.len() > 1 {
            return Err(format!("{} steps blocked, at most one allowed", blocked.len()));
        }
        if let Some(step) = blocked.first() {
            if step.question.as_deref().map_or(true, |q| q.trim().is_empty()) {
                return Err("blocked step must carry a question".to_string());
            }
        }
        Ok(())
    }
}
