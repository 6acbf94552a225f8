//! Agent domain model.
//!
//! An agent is a named virtual worker identity holding an approved-tool
//! set, bounded conversation memory, and counters maintained by the
//! orchestrator. The position fields exist only for the cosmetic
//! front-end and carry no orchestration meaning.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tools every agent may use without operator approval.
///
/// This baseline set is immutable: it is always present in
/// `approved_tools` and cannot be revoked.
pub const BASELINE_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

/// Maximum number of conversation entries retained per agent.
pub const MEMORY_LIMIT: usize = 50;

/// Agent activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Available for dispatch.
    Idle,
    /// The adversary is consulting the oracle on its behalf.
    Thinking,
    /// A worker session is running for this agent.
    Working,
    /// Cosmetic state driven by the front-end.
    Walking,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Working => "working",
            Self::Walking => "walking",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "thinking" => Some(Self::Thinking),
            "working" => Some(Self::Working),
            "walking" => Some(Self::Walking),
            _ => None,
        }
    }
}

/// A named virtual worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique human-readable name.
    pub name: String,
    /// Current activity state.
    pub state: AgentState,
    /// Tools the worker subprocess is allowed to use.
    pub approved_tools: BTreeSet<String>,
    /// Optional per-agent system prompt addendum.
    pub system_prompt: Option<String>,
    /// Task currently assigned, if any.
    pub current_task_id: Option<Uuid>,
    /// Number of worker dispatches that completed successfully.
    pub tasks_completed: u64,
    /// Accumulated token usage reported by workers.
    pub tokens_used: u64,
    /// Cosmetic placement for the isometric front-end.
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    /// When the agent was hired.
    pub hired_at: DateTime<Utc>,
}

impl Agent {
    /// Create a new idle agent with the baseline tool set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: AgentState::Idle,
            approved_tools: Self::baseline_tools(),
            system_prompt: None,
            current_task_id: None,
            tasks_completed: 0,
            tokens_used: 0,
            x: 0.0,
            y: 0.0,
            hired_at: Utc::now(),
        }
    }

    /// The immutable baseline tool set.
    pub fn baseline_tools() -> BTreeSet<String> {
        BASELINE_TOOLS.iter().map(|t| (*t).to_string()).collect()
    }

    /// Add a tool to the approved set.
    pub fn approve_tool(&mut self, name: impl Into<String>) {
        self.approved_tools.insert(name.into());
    }

    /// Remove a tool from the approved set.
    ///
    /// Baseline tools cannot be revoked; returns false when the removal
    /// was refused or the tool was not present.
    pub fn revoke_tool(&mut self, name: &str) -> bool {
        if BASELINE_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(name)) {
            return false;
        }
        self.approved_tools.remove(name)
    }

    /// Check approval, ignoring case.
    pub fn is_tool_approved(&self, name: &str) -> bool {
        self.approved_tools
            .iter()
            .any(|t| t.eq_ignore_ascii_case(name))
    }
}

/// One remembered conversation exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
    /// Task that produced this exchange, if any.
    pub task_id: Option<Uuid>,
}

/// Bounded FIFO of an agent's recent conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    pub conversations: Vec<ConversationEntry>,
}

impl AgentMemory {
    /// Append an entry, trimming to the most recent [`MEMORY_LIMIT`].
    pub fn record(&mut self, role: impl Into<String>, content: impl Into<String>, task_id: Option<Uuid>) {
        self.conversations.push(ConversationEntry {
            timestamp: Utc::now(),
            role: role.into(),
            content: content.into(),
            task_id,
        });
        if self.conversations.len() > MEMORY_LIMIT {
            let excess = self.conversations.len() - MEMORY_LIMIT;
            self.conversations.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_has_baseline_tools() {
        let agent = Agent::new("Sam");
        assert_eq!(agent.state, AgentState::Idle);
        for tool in BASELINE_TOOLS {
            assert!(agent.is_tool_approved(tool));
        }
    }

    #[test]
    fn test_baseline_tools_cannot_be_revoked() {
        let mut agent = Agent::new("Sam");
        assert!(!agent.revoke_tool("Read"));
        assert!(!agent.revoke_tool("read"));
        assert!(agent.is_tool_approved("Read"));

        agent.approve_tool("Bash");
        assert!(agent.revoke_tool("Bash"));
        assert!(!agent.is_tool_approved("Bash"));
    }

    #[test]
    fn test_tool_approval_is_case_insensitive() {
        let mut agent = Agent::new("Sam");
        agent.approve_tool("Bash");
        assert!(agent.is_tool_approved("bash"));
        assert!(agent.is_tool_approved("BASH"));
    }

    #[test]
    fn test_memory_trims_to_limit() {
        let mut memory = AgentMemory::default();
        for i in 0..(MEMORY_LIMIT + 10) {
            memory.record("user", format!("message {i}"), None);
        }
        assert_eq!(memory.conversations.len(), MEMORY_LIMIT);
        // The oldest entries were dropped.
        assert_eq!(memory.conversations[0].content, "message 10");
    }

    #[test]
    fn test_agent_state_round_trip() {
        for state in [
            AgentState::Idle,
            AgentState::Thinking,
            AgentState::Working,
            AgentState::Walking,
        ] {
            assert_eq!(AgentState::from_str(state.as_str()), Some(state));
        }
        assert!(AgentState::from_str("sleeping").is_none());
    }
}
