//! Goal domain model.
//!
//! A goal is a durable operator-authored intention attached to one
//! agent. Goals move `active ↔ paused` freely; `completed` and `failed`
//! are terminal.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default worker turn cap per plan step.
pub const DEFAULT_MAX_TURNS_PER_STEP: u32 = 25;

/// Status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this status can transition to another status.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        matches!(
            (self, new_status),
            (Self::Active, Self::Paused)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
                | (Self::Paused, Self::Active)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A durable operator-authored intention attached to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGoal {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub description: String,
    /// Optional goal-scoped system prompt addendum.
    pub system_prompt: Option<String>,
    /// Free-form constraints injected into every prompt.
    pub constraints: Vec<String>,
    /// Directory the workers operate in.
    pub working_directory: PathBuf,
    /// Worker turn cap applied to each dispatched step.
    pub max_turns_per_step: u32,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentGoal {
    pub fn new(agent_id: Uuid, description: impl Into<String>, working_directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            description: description.into(),
            system_prompt: None,
            constraints: Vec::new(),
            working_directory,
            max_turns_per_step: DEFAULT_MAX_TURNS_PER_STEP,
            status: GoalStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status, updating the timestamp.
    pub fn transition_to(&mut self, new_status: GoalStatus) -> Result<(), String> {
        if self.status == new_status {
            return Ok(());
        }
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "cannot transition goal from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("goal description cannot be empty".to_string());
        }
        if self.max_turns_per_step == 0 {
            return Err("max_turns_per_step must be at least 1".to_string());
        }
        Ok(())
    }
}
