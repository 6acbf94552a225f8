//! Session domain model.
//!
//! A session wraps one worker subprocess invocation: its parsed message
//! transcript, its lifecycle status, and any tool permissions the
//! worker was denied and is now waiting on.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Allocated, subprocess not yet confirmed running.
    Starting,
    /// Subprocess running and streaming events.
    Active,
    /// Paused on denied tool permissions; close events are ignored.
    WaitingInput,
    /// Ended normally.
    Completed,
    /// Ended on a worker failure or operator stop.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Kind of a parsed session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    Thinking,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::System => "system",
        }
    }
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl SessionMessage {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message_type,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A tool permission the worker was denied and now waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermission {
    pub tool_name: String,
    pub tool_input: Option<serde_json::Value>,
}

/// Conversational state wrapping one worker subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Uuid,
    pub status: SessionStatus,
    pub messages: Vec<SessionMessage>,
    pub pending_permissions: Vec<PendingPermission>,
    /// Directory the worker runs in; reused on resume.
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(agent_id: Uuid, task_id: Uuid, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_id,
            status: SessionStatus::Starting,
            messages: Vec::new(),
            pending_permissions: Vec::new(),
            working_dir,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn push_message(&mut self, message: SessionMessage) {
        self.messages.push(message);
        self.last_activity_at = Utc::now();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.last_activity_at = Utc::now();
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }

    pub fn has_assistant_message(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.message_type == MessageType::Assistant)
    }

    /// Concatenation of all assistant text, in stream order.
    pub fn assistant_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.message_type == MessageType::Assistant)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    /// The prompt that started (or most recently resumed) the session.
    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.message_type == MessageType::User)
            .map(|m| m.content.as_str())
    }
}
