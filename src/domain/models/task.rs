//! Task domain model.
//!
//! One task record is created per worker dispatch (recon, step
//! execution, and resumed steps included). Task IDs double as the
//! correlation tokens that tie `session_ended` events back to the plan
//! step that initiated them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of log entries retained per task.
pub const TASK_LOG_LIMIT: usize = 100;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A timestamped task log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// An ephemeral record of one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub assigned_agent_id: Option<Uuid>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker output on completion, or the error message on failure.
    pub result: Option<String>,
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    pub fn new(description: impl Into<String>, assigned_agent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            assigned_agent_id,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            logs: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.result = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Append a log line, trimming to the most recent [`TASK_LOG_LIMIT`].
    pub fn push_log(&mut self, message: impl Into<String>) {
        self.logs.push(TaskLogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        if self.logs.len() > TASK_LOG_LIMIT {
            let excess = self.logs.len() - TASK_LOG_LIMIT;
            self.logs.drain(..excess);
        }
    }
}
