//! Typed event bus for the orchestration engine.
//!
//! A dependency-injected broadcast channel. Every mutation of interest
//! publishes one [`EngineEvent`]; subscribers hold independent
//! receivers, so a slow or failing consumer never blocks the others
//! and unsubscribing is just dropping the receiver.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event envelope with correlation identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    /// Monotonically increasing, assigned by the bus at publish.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<Uuid>,
    pub goal_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub payload: EnginePayload,
}

impl EngineEvent {
    pub fn new(payload: EnginePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            agent_id: None,
            goal_id: None,
            task_id: None,
            payload,
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_goal(mut self, goal_id: Uuid) -> Self {
        self.goal_id = Some(goal_id);
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Tagged payload, one variant per topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EnginePayload {
    // Agent lifecycle
    AgentHired {
        agent_id: Uuid,
        name: String,
    },
    AgentFired {
        agent_id: Uuid,
        name: String,
    },
    AgentStateChanged {
        agent_id: Uuid,
        state: String,
    },

    // Task lifecycle
    TaskCreated {
        task_id: Uuid,
        description: String,
    },
    TaskStarted {
        task_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    TaskLog {
        task_id: Uuid,
        message: String,
    },

    // Goals and plans
    GoalCreated {
        goal_id: Uuid,
        agent_id: Uuid,
        description: String,
    },
    GoalStatusChanged {
        goal_id: Uuid,
        from: String,
        to: String,
    },
    PlanCreated {
        goal_id: Uuid,
        version: u32,
        step_count: usize,
    },
    StepStarted {
        goal_id: Uuid,
        step_id: Uuid,
    },
    StepCompleted {
        goal_id: Uuid,
        step_id: Uuid,
    },
    StepFailed {
        goal_id: Uuid,
        step_id: Uuid,
    },

    // Sessions
    SessionCreated {
        session_id: Uuid,
        agent_id: Uuid,
        task_id: Uuid,
    },
    SessionStatusChanged {
        session_id: Uuid,
        status: String,
    },
    SessionMessage {
        session_id: Uuid,
        message_type: String,
        preview: String,
    },
    /// Published by the bridge after settlement: the task, agent
    /// counters, memory, and single-flight guard already reflect the
    /// ended session.
    SessionEnded {
        session_id: Uuid,
        agent_id: Uuid,
        task_id: Uuid,
        status: String,
        result: String,
    },
    PermissionRequested {
        session_id: Uuid,
        agent_id: Uuid,
        tool_name: String,
    },

    // Orchestration
    QuestionRaised {
        goal_id: Uuid,
        step_id: Uuid,
        agent_id: Uuid,
        question: String,
    },
    TriggerFired {
        trigger_id: Uuid,
        goal_id: Uuid,
    },
    PreferenceLearned {
        agent_id: Uuid,
        key: String,
        confidence: String,
    },
    OracleError {
        context: String,
        error: String,
    },
}

impl EnginePayload {
    /// Topic name for filtering, log sinks, and display.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::AgentHired { .. } => "agent_hired",
            Self::AgentFired { .. } => "agent_fired",
            Self::AgentStateChanged { .. } => "agent_state_changed",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskLog { .. } => "task_log",
            Self::GoalCreated { .. } => "goal_created",
            Self::GoalStatusChanged { .. } => "goal_status_changed",
            Self::PlanCreated { .. } => "plan_created",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::SessionMessage { .. } => "session_message",
            Self::SessionEnded { .. } => "session_ended",
            Self::PermissionRequested { .. } => "permission_requested",
            Self::QuestionRaised { .. } => "question_raised",
            Self::TriggerFired { .. } => "trigger_fired",
            Self::PreferenceLearned { .. } => "preference_learned",
            Self::OracleError { .. } => "oracle_error",
        }
    }
}

/// Central broadcast bus.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event, stamping its sequence number. Delivery is
    /// best-effort: publishing with no subscribers is not an error.
    pub fn publish(&self, mut event: EngineEvent) {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_assignment() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::new(EnginePayload::TriggerFired {
            trigger_id: Uuid::new_v4(),
            goal_id: Uuid::new_v4(),
        }));
        bus.publish(EngineEvent::new(EnginePayload::TriggerFired {
            trigger_id: Uuid::new_v4(),
            goal_id: Uuid::new_v4(),
        }));

        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(bus.current_sequence(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::new(EnginePayload::OracleError {
            context: "test".to_string(),
            error: "nope".to_string(),
        }));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_topic_names() {
        let payload = EnginePayload::SessionEnded {
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            status: "completed".to_string(),
            result: String::new(),
        };
        assert_eq!(payload.topic(), "session_ended");
    }

    #[test]
    fn test_event_serializes_for_log_sink() {
        let event = EngineEvent::new(EnginePayload::QuestionRaised {
            goal_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            question: "which driver?".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["type"], "QuestionRaised");
        assert!(value["timestamp"].is_string());
    }
}
