//! Worker session lifecycle and stream parsing.
//!
//! Owns the `session_id → AgentSession` mapping, translates raw worker
//! stream events into transcript messages, and mediates tool-permission
//! denials: a terminal event carrying denials parks the session in
//! `waiting_input` instead of ending it, and close events are ignored
//! until the operator decides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentSession, MessageType, PendingPermission, SessionMessage, SessionStatus,
};
use crate::domain::ports::worker::{WorkerEvent, WorkerLaunch, WorkerRuntime, WorkerStreamEvent};
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};

const PREVIEW_LIMIT: usize = 120;
const PERMISSION_CONTINUATION: &str = "Permission granted. Continue your task.";

/// Summary handed to the bridge when a session actually ends.
#[derive(Debug, Clone)]
pub struct SessionEnd {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Uuid,
    pub status: SessionStatus,
    /// Concatenated assistant text, in stream order.
    pub result: String,
    /// Error message when the session ended in `Error`.
    pub error: Option<String>,
    /// The prompt that started the session.
    pub prompt: String,
    /// Token usage reported by the terminal event, when present.
    pub tokens_used: u64,
}

/// Outcome of a permission approval.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    /// Whether a pending entry matched and was removed.
    pub resolved: bool,
    /// True once no pending permissions remain.
    pub all_approved: bool,
    /// The canonically-cased tool name that was resolved.
    pub canonical_name: Option<String>,
}

/// Owns worker sessions; one per running subprocess.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, AgentSession>>,
    agent_sessions: RwLock<HashMap<Uuid, Uuid>>,
    runtime: Arc<dyn WorkerRuntime>,
    bus: Arc<EventBus>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, bus: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            agent_sessions: RwLock::new(HashMap::new()),
            runtime,
            bus,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Allocate a session and spawn its worker subprocess.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(agent_id = %agent_id, task_id = %task_id))]
    pub async fn start_session(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        prompt: String,
        working_dir: PathBuf,
        system_prompt: Option<String>,
        allowed_tools: Vec<String>,
        max_turns: Option<u32>,
        additional_dirs: Vec<PathBuf>,
    ) -> DomainResult<Uuid> {
        {
            let agent_sessions = self.agent_sessions.read().await;
            if agent_sessions.contains_key(&agent_id) {
                return Err(DomainError::AgentBusy(agent_id));
            }
        }

        let mut session = AgentSession::new(agent_id, task_id, working_dir.clone());
        session.push_message(SessionMessage::new(MessageType::User, prompt.clone()));
        let session_id = session.id;

        self.sessions.write().await.insert(session_id, session);
        self.agent_sessions.write().await.insert(agent_id, session_id);
        self.bus.publish(
            EngineEvent::new(EnginePayload::SessionCreated {
                session_id,
                agent_id,
                task_id,
            })
            .with_agent(agent_id)
            .with_task(task_id),
        );

        let launch = WorkerLaunch {
            session_id,
            prompt,
            working_dir,
            system_prompt,
            allowed_tools,
            max_turns,
            additional_dirs,
        };
        if let Err(e) = self.runtime.spawn(launch).await {
            self.sessions.write().await.remove(&session_id);
            self.agent_sessions.write().await.remove(&agent_id);
            return Err(e.into());
        }

        // The subprocess may have already closed (and ended the session
        // through the event pump); only a still-starting session
        // activates.
        let activated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&session_id) {
                Some(session) if session.status == SessionStatus::Starting => {
                    session.set_status(SessionStatus::Active);
                    true
                }
                _ => false,
            }
        };
        if activated {
            self.publish_status(session_id, SessionStatus::Active);
        }
        Ok(session_id)
    }

    /// Append a user message and resume the worker with it.
    pub async fn send_message(
        &self,
        session_id: Uuid,
        message: String,
        working_dir: PathBuf,
        allowed_tools: Vec<String>,
    ) -> DomainResult<()> {
        let was_waiting = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(DomainError::SessionNotFound(session_id))?;
            if session.is_ended() {
                return Err(DomainError::InvalidTransition(format!(
                    "session {session_id} already ended"
                )));
            }
            session.push_message(SessionMessage::new(MessageType::User, message.clone()));
            let was_waiting = session.status == SessionStatus::WaitingInput;
            session.set_status(SessionStatus::Active);
            was_waiting
        };
        if was_waiting {
            self.publish_status(session_id, SessionStatus::Active);
        }

        let launch = WorkerLaunch {
            session_id,
            prompt: message,
            working_dir,
            system_prompt: None,
            allowed_tools,
            max_turns: None,
            additional_dirs: Vec::new(),
        };
        self.runtime.resume(launch).await.map_err(DomainError::from)
    }

    /// Kill the subprocess and end the session in `Error`.
    pub async fn stop_session(&self, session_id: Uuid) -> DomainResult<Option<SessionEnd>> {
        if self.sessions.read().await.get(&session_id).is_none() {
            return Err(DomainError::SessionNotFound(session_id));
        }
        let _ = self.runtime.kill(session_id).await;
        Ok(self
            .end_session(
                session_id,
                SessionStatus::Error,
                Some("stopped by operator".to_string()),
                0,
            )
            .await)
    }

    pub async fn get(&self, session_id: Uuid) -> Option<AgentSession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// The agent's live session, if one exists.
    pub async fn session_for_agent(&self, agent_id: Uuid) -> Option<AgentSession> {
        let session_id = *self.agent_sessions.read().await.get(&agent_id)?;
        self.get(session_id).await
    }

    // ------------------------------------------------------------------
    // Permission negotiation
    // ------------------------------------------------------------------

    /// Case-insensitive resolve of one pending permission. Idempotent:
    /// re-approving a resolved tool reports `resolved: false`.
    pub async fn approve_permission(
        &self,
        session_id: Uuid,
        tool_name: &str,
    ) -> DomainResult<PermissionDecision> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(DomainError::SessionNotFound(session_id))?;

        let position = session
            .pending_permissions
            .iter()
            .position(|p| p.tool_name.eq_ignore_ascii_case(tool_name));

        match position {
            Some(index) => {
                let canonical = session.pending_permissions.remove(index).tool_name;
                Ok(PermissionDecision {
                    resolved: true,
                    all_approved: session.pending_permissions.is_empty(),
                    canonical_name: Some(canonical),
                })
            }
            None => Ok(PermissionDecision {
                resolved: false,
                all_approved: session.pending_permissions.is_empty(),
                canonical_name: None,
            }),
        }
    }

    /// Refuse the pending permissions and end the session normally.
    pub async fn deny_permission(&self, session_id: Uuid) -> DomainResult<Option<SessionEnd>> {
        if self.sessions.read().await.get(&session_id).is_none() {
            return Err(DomainError::SessionNotFound(session_id));
        }
        Ok(self
            .end_session(session_id, SessionStatus::Completed, None, 0)
            .await)
    }

    /// Send the canned continuation with the updated tool list.
    pub async fn resume_session(
        &self,
        session_id: Uuid,
        allowed_tools: Vec<String>,
        working_dir: PathBuf,
    ) -> DomainResult<()> {
        self.send_message(
            session_id,
            PERMISSION_CONTINUATION.to_string(),
            working_dir,
            allowed_tools,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Stream handling
    // ------------------------------------------------------------------

    /// Fold one worker stream event into its session. Returns a
    /// [`SessionEnd`] when (and only when) the session actually ends.
    pub async fn handle_worker_event(&self, ev: WorkerStreamEvent) -> Option<SessionEnd> {
        if ev.event.is_terminal() {
            return self.handle_terminal_event(&ev).await;
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&ev.session_id)?;
        if session.is_ended() {
            return None;
        }

        let messages = map_stream_event(&ev.event);
        let mut previews = Vec::new();
        for message in messages {
            previews.push((message.message_type, preview(&message.content)));
            session.push_message(message);
        }
        drop(sessions);

        for (message_type, preview) in previews {
            self.bus.publish(EngineEvent::new(EnginePayload::SessionMessage {
                session_id: ev.session_id,
                message_type: message_type.as_str().to_string(),
                preview,
            }));
        }
        None
    }

    async fn handle_terminal_event(&self, ev: &WorkerStreamEvent) -> Option<SessionEnd> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&ev.session_id)?;

        // Double-end protection: late closes from an already-ended
        // session are ignored.
        if session.is_ended() {
            return None;
        }

        // A session waiting on the operator must not be ended by
        // trailing close events.
        if session.status == SessionStatus::WaitingInput {
            return None;
        }

        let denials = collect_denials(&ev.event.data);
        if !denials.is_empty() {
            let agent_id = session.agent_id;
            let tool_names: Vec<String> =
                denials.iter().map(|d| d.tool_name.clone()).collect();
            session.pending_permissions = denials;
            session.set_status(SessionStatus::WaitingInput);
            drop(sessions);

            self.publish_status(ev.session_id, SessionStatus::WaitingInput);
            for tool_name in tool_names {
                self.bus.publish(
                    EngineEvent::new(EnginePayload::PermissionRequested {
                        session_id: ev.session_id,
                        agent_id,
                        tool_name,
                    })
                    .with_agent(agent_id),
                );
            }
            return None;
        }

        // Keep the terminal result text unless assistant content already
        // streamed in.
        if let Some(result) = ev.event.data.get("result").and_then(Value::as_str) {
            if !result.is_empty() && !session.has_assistant_message() {
                session.push_message(SessionMessage::new(MessageType::Assistant, result));
            }
        }

        let status = if ev.event.subtype() == Some("error") {
            SessionStatus::Error
        } else {
            SessionStatus::Completed
        };
        let error = (status == SessionStatus::Error).then(|| terminal_error(&ev.event.data));
        let tokens = terminal_tokens(&ev.event.data);

        drop(sessions);
        self.end_session(ev.session_id, status, error, tokens).await
    }

    /// Seal a session with a terminal status. No-op when already ended.
    async fn end_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        error: Option<String>,
        tokens_used: u64,
    ) -> Option<SessionEnd> {
        let end = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&session_id)?;
            if session.is_ended() {
                return None;
            }
            session.set_status(status);
            SessionEnd {
                session_id,
                agent_id: session.agent_id,
                task_id: session.task_id,
                status,
                result: session.assistant_text(),
                error,
                prompt: session.first_user_message().unwrap_or_default().to_string(),
                tokens_used,
            }
        };
        self.agent_sessions.write().await.remove(&end.agent_id);
        self.publish_status(session_id, status);
        Some(end)
    }

    fn publish_status(&self, session_id: Uuid, status: SessionStatus) {
        self.bus.publish(EngineEvent::new(EnginePayload::SessionStatusChanged {
            session_id,
            status: status.as_str().to_string(),
        }));
    }
}

/// Map one raw stream event onto zero or more transcript messages.
fn map_stream_event(event: &WorkerEvent) -> Vec<SessionMessage> {
    match event.event_type.as_str() {
        "assistant" => {
            let content = event.data.get("message").and_then(|m| m.get("content"));
            match content {
                Some(Value::String(text)) if !text.is_empty() => {
                    vec![SessionMessage::new(MessageType::Assistant, text.clone())]
                }
                Some(Value::Array(blocks)) => blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .filter(|text| !text.is_empty())
                    .map(|text| SessionMessage::new(MessageType::Assistant, text))
                    .collect(),
                _ => Vec::new(),
            }
        }
        "content_block_start" => {
            let Some(block) = event.data.get("content_block") else {
                return Vec::new();
            };
            match block.get("type").and_then(Value::as_str) {
                Some("thinking") => text_message(block, "thinking", MessageType::Thinking),
                Some("text") => text_message(block, "text", MessageType::Assistant),
                Some("tool_use") => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                    let metadata = serde_json::json!({
                        "toolName": name,
                        "toolId": block.get("id").cloned().unwrap_or(Value::Null),
                        "input": block.get("input").cloned().unwrap_or(Value::Null),
                    });
                    vec![SessionMessage::new(MessageType::ToolUse, name).with_metadata(metadata)]
                }
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let Some(delta) = event.data.get("delta") else {
                return Vec::new();
            };
            match delta.get("type").and_then(Value::as_str) {
                Some("thinking_delta") => text_message(delta, "thinking", MessageType::Thinking),
                Some("text_delta") => text_message(delta, "text", MessageType::Assistant),
                // Partial tool-input JSON is noise.
                _ => Vec::new(),
            }
        }
        "tool_result" => vec![tool_result_message(&event.data)],
        "system" => {
            if event.subtype() == Some("tool_result") {
                vec![tool_result_message(&event.data)]
            } else {
                let content = event
                    .data
                    .get("content")
                    .and_then(Value::as_str)
                    .map_or_else(|| event.data.to_string(), str::to_string);
                vec![SessionMessage::new(MessageType::System, content)]
            }
        }
        _ => Vec::new(),
    }
}

fn text_message(container: &Value, field: &str, message_type: MessageType) -> Vec<SessionMessage> {
    match container.get(field).and_then(Value::as_str) {
        Some(text) if !text.is_empty() => vec![SessionMessage::new(message_type, text)],
        _ => Vec::new(),
    }
}

fn tool_result_message(data: &Value) -> SessionMessage {
    let content = match data.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => data.to_string(),
    };
    SessionMessage::new(MessageType::ToolResult, content)
}

/// Deduplicate permission denials case-insensitively by tool name,
/// preserving the first-seen casing.
fn collect_denials(data: &Value) -> Vec<PendingPermission> {
    let Some(items) = data.get("permission_denials").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut seen: Vec<String> = Vec::new();
    let mut denials = Vec::new();
    for item in items {
        let Some(name) = item
            .get("tool_name")
            .or_else(|| item.get("toolName"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let lower = name.to_lowercase();
        if seen.contains(&lower) {
            continue;
        }
        seen.push(lower);
        denials.push(PendingPermission {
            tool_name: name.to_string(),
            tool_input: item.get("tool_input").cloned(),
        });
    }
    denials
}

fn terminal_tokens(data: &Value) -> u64 {
    let Some(usage) = data.get("usage") else {
        return 0;
    };
    ["input_tokens", "output_tokens"]
        .iter()
        .filter_map(|key| usage.get(key).and_then(Value::as_u64))
        .sum()
}

fn terminal_error(data: &Value) -> String {
    if let Some(text) = data
        .get("error")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return text.to_string();
    }
    if let Some(text) = data
        .get("result")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return text.to_string();
    }
    match data.get("exit_code").and_then(Value::as_i64) {
        Some(code) => format!("worker exited with code {code}"),
        None => "worker session ended in error".to_string(),
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_LIMIT {
        content.to_string()
    } else {
        let cut: String = content.chars().take(PREVIEW_LIMIT).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::domain::ports::worker::WorkerError;

    /// Runtime double that accepts every request without a subprocess.
    struct NullRuntime;

    #[async_trait]
    impl WorkerRuntime for NullRuntime {
        async fn spawn(&self, _launch: WorkerLaunch) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn resume(&self, _launch: WorkerLaunch) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn kill(&self, _session_id: Uuid) -> Result<bool, WorkerError> {
            Ok(true)
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(NullRuntime), Arc::new(EventBus::default()))
    }

    async fn started_session(manager: &SessionManager) -> Uuid {
        manager
            .start_session(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "do the thing".to_string(),
                PathBuf::from("/tmp"),
                None,
                vec!["Read".to_string()],
                Some(10),
                Vec::new(),
            )
            .await
            .expect("start session")
    }

    fn raw(session_id: Uuid, json: serde_json::Value) -> WorkerStreamEvent {
        WorkerStreamEvent {
            session_id,
            event: serde_json::from_value(json).expect("worker event"),
        }
    }

    #[tokio::test]
    async fn test_one_session_per_agent() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        manager
            .start_session(
                agent_id,
                Uuid::new_v4(),
                "first".to_string(),
                PathBuf::from("/tmp"),
                None,
                Vec::new(),
                None,
                Vec::new(),
            )
            .await
            .unwrap();

        let second = manager
            .start_session(
                agent_id,
                Uuid::new_v4(),
                "second".to_string(),
                PathBuf::from("/tmp"),
                None,
                Vec::new(),
                None,
                Vec::new(),
            )
            .await;
        assert!(matches!(second, Err(DomainError::AgentBusy(_))));
    }

    #[tokio::test]
    async fn test_stream_mapping_table() {
        let manager = manager();
        let session_id = started_session(&manager).await;

        let events = [
            serde_json::json!({"type": "assistant", "message": {"content": "plain text"}}),
            serde_json::json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "block text"},
                {"type": "tool_use", "name": "Bash"},
            ]}}),
            serde_json::json!({"type": "content_block_start", "content_block": {
                "type": "thinking", "thinking": "pondering"}}),
            serde_json::json!({"type": "content_block_start", "content_block": {
                "type": "tool_use", "name": "Grep", "id": "tu_1", "input": {"pattern": "x"}}}),
            serde_json::json!({"type": "content_block_delta", "delta": {
                "type": "text_delta", "text": " and more"}}),
            serde_json::json!({"type": "content_block_delta", "delta": {
                "type": "input_json_delta", "partial_json": "{\"pa"}}),
            serde_json::json!({"type": "tool_result", "content": "42 matches"}),
            serde_json::json!({"type": "system", "subtype": "stderr", "content": "warning"}),
        ];
        for event in events {
            assert!(manager.handle_worker_event(raw(session_id, event)).await.is_none());
        }

        let session = manager.get(session_id).await.unwrap();
        let kinds: Vec<MessageType> = session.messages.iter().map(|m| m.message_type).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::User,
                MessageType::Assistant,
                MessageType::Assistant,
                MessageType::Thinking,
                MessageType::ToolUse,
                MessageType::Assistant,
                MessageType::ToolResult,
                MessageType::System,
            ]
        );

        let tool_use = &session.messages[4];
        let metadata = tool_use.metadata.as_ref().unwrap();
        assert_eq!(metadata["toolName"], "Grep");
        assert_eq!(metadata["toolId"], "tu_1");

        assert_eq!(session.assistant_text(), "plain textblock text and more");
    }

    #[tokio::test]
    async fn test_clean_close_ends_session() {
        let manager = manager();
        let session_id = started_session(&manager).await;

        manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "assistant", "message": {"content": "did it"}}),
            ))
            .await;
        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success", "result": "did it"}),
            ))
            .await
            .expect("session end");

        assert_eq!(end.status, SessionStatus::Completed);
        assert_eq!(end.result, "did it");
        assert_eq!(end.prompt, "do the thing");

        // The terminal result was suppressed: assistant content already
        // streamed.
        let session = manager.get(session_id).await.unwrap();
        let assistant_count = session
            .messages
            .iter()
            .filter(|m| m.message_type == MessageType::Assistant)
            .count();
        assert_eq!(assistant_count, 1);
    }

    #[tokio::test]
    async fn test_result_fallback_appended_without_assistant() {
        let manager = manager();
        let session_id = started_session(&manager).await;

        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success", "result": "only result"}),
            ))
            .await
            .expect("session end");
        assert_eq!(end.result, "only result");
    }

    #[tokio::test]
    async fn test_error_close_captures_message() {
        let manager = manager();
        let session_id = started_session(&manager).await;

        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "error", "error": "boom"}),
            ))
            .await
            .expect("session end");
        assert_eq!(end.status, SessionStatus::Error);
        assert_eq!(end.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_double_end_protection() {
        let manager = manager();
        let session_id = started_session(&manager).await;

        let first = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success"}),
            ))
            .await;
        assert!(first.is_some());

        let second = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "close", "exit_code": 0}),
            ))
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_permission_denials_park_the_session() {
        let bus = Arc::new(EventBus::default());
        let manager = SessionManager::new(Arc::new(NullRuntime), bus.clone());
        let agent_id = Uuid::new_v4();
        let session_id = manager
            .start_session(
                agent_id,
                Uuid::new_v4(),
                "work".to_string(),
                PathBuf::from("/tmp"),
                None,
                Vec::new(),
                None,
                Vec::new(),
            )
            .await
            .unwrap();

        let mut rx = bus.subscribe();
        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success",
                    "permission_denials": [
                        {"tool_name": "Bash", "tool_input": {"command": "ls"}},
                        {"tool_name": "bash"},
                        {"tool_name": "Write"},
                    ]}),
            ))
            .await;
        assert!(end.is_none());

        let session = manager.get(session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::WaitingInput);
        // Case-insensitive dedup kept two unique tools.
        assert_eq!(session.pending_permissions.len(), 2);

        // One permission_requested per unique tool.
        let mut requested = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EnginePayload::PermissionRequested { tool_name, .. } = event.payload {
                requested.push(tool_name);
            }
        }
        assert_eq!(requested, vec!["Bash".to_string(), "Write".to_string()]);

        // Close events must not end a waiting session.
        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "close", "exit_code": 0}),
            ))
            .await;
        assert!(end.is_none());
        assert_eq!(
            manager.get(session_id).await.unwrap().status,
            SessionStatus::WaitingInput
        );
    }

    #[tokio::test]
    async fn test_approve_permission_idempotent() {
        let manager = manager();
        let session_id = started_session(&manager).await;
        manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success",
                    "permission_denials": [{"tool_name": "Bash"}, {"tool_name": "Write"}]}),
            ))
            .await;

        let first = manager.approve_permission(session_id, "bash").await.unwrap();
        assert!(first.resolved);
        assert!(!first.all_approved);
        assert_eq!(first.canonical_name.as_deref(), Some("Bash"));

        // Approving the same tool again is a no-op.
        let again = manager.approve_permission(session_id, "BASH").await.unwrap();
        assert!(!again.resolved);
        assert!(!again.all_approved);

        let last = manager.approve_permission(session_id, "write").await.unwrap();
        assert!(last.resolved);
        assert!(last.all_approved);

        let after = manager.approve_permission(session_id, "write").await.unwrap();
        assert!(!after.resolved);
        assert!(after.all_approved);
    }

    #[tokio::test]
    async fn test_deny_permission_completes_session() {
        let manager = manager();
        let session_id = started_session(&manager).await;
        manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success",
                    "permission_denials": [{"tool_name": "Bash"}]}),
            ))
            .await;

        let end = manager.deny_permission(session_id).await.unwrap().unwrap();
        assert_eq!(end.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_reactivates_waiting_session() {
        let manager = manager();
        let session_id = started_session(&manager).await;
        manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success",
                    "permission_denials": [{"tool_name": "Bash"}]}),
            ))
            .await;
        manager.approve_permission(session_id, "Bash").await.unwrap();

        manager
            .resume_session(session_id, vec!["Read".to_string(), "Bash".to_string()], PathBuf::from("/tmp"))
            .await
            .unwrap();

        let session = manager.get(session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        let last = session.messages.last().unwrap();
        assert_eq!(last.message_type, MessageType::User);
        assert_eq!(last.content, PERMISSION_CONTINUATION);

        // A clean close now ends the session normally.
        let end = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "success", "result": "done"}),
            ))
            .await;
        assert_eq!(end.unwrap().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_session_ends_in_error() {
        let manager = manager();
        let session_id = started_session(&manager).await;
        let end = manager.stop_session(session_id).await.unwrap().unwrap();
        assert_eq!(end.status, SessionStatus::Error);
        assert_eq!(end.error.as_deref(), Some("stopped by operator"));

        // Trailing close from the killed process is absorbed.
        let late = manager
            .handle_worker_event(raw(
                session_id,
                serde_json::json!({"type": "result", "subtype": "error", "exit_code": null}),
            ))
            .await;
        assert!(late.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session_event_ignored() {
        let manager = manager();
        let end = manager
            .handle_worker_event(raw(
                Uuid::new_v4(),
                serde_json::json!({"type": "result", "subtype": "success"}),
            ))
            .await;
        assert!(end.is_none());
    }
}
