//! Worker runtime port: spawn, stream, resume, and kill tool-equipped
//! worker subprocesses.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a worker runtime.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker subprocess: {0}")]
    Spawn(String),

    #[error("no running worker for session {0}")]
    NoSuchSession(Uuid),
}

/// One event from a worker's stream-JSON stdout, or a synthetic event
/// fabricated by the runtime (stderr chunks, process close).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl WorkerEvent {
    /// Parse one stdout line. Returns None when the line is not a JSON
    /// object carrying a `type` field; callers fall back to
    /// [`WorkerEvent::system_raw`].
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// Synthetic event wrapping an unparseable stdout line.
    pub fn system_raw(content: &str) -> Self {
        Self {
            event_type: "system".to_string(),
            data: serde_json::json!({ "content": content }),
        }
    }

    /// Synthetic event wrapping a stderr chunk.
    pub fn stderr(content: &str) -> Self {
        Self {
            event_type: "system".to_string(),
            data: serde_json::json!({ "subtype": "stderr", "content": content }),
        }
    }

    /// Synthetic terminal event emitted after the subprocess closes.
    pub fn close(exit_code: Option<i32>) -> Self {
        let subtype = if exit_code == Some(0) { "close" } else { "error" };
        Self {
            event_type: "result".to_string(),
            data: serde_json::json!({ "subtype": subtype, "exit_code": exit_code }),
        }
    }

    pub fn subtype(&self) -> Option<&str> {
        self.data.get("subtype").and_then(|v| v.as_str())
    }

    /// All `result` events are terminal regardless of subtype.
    pub fn is_terminal(&self) -> bool {
        self.event_type == "result"
    }
}

/// Parameters for launching or resuming a worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub session_id: Uuid,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub additional_dirs: Vec<PathBuf>,
}

/// A worker event tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct WorkerStreamEvent {
    pub session_id: Uuid,
    pub event: WorkerEvent,
}

/// Spawns and controls worker subprocesses. Parsed events flow out
/// through the channel the runtime was constructed with.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start a fresh subprocess for the session.
    async fn spawn(&self, launch: WorkerLaunch) -> Result<(), WorkerError>;

    /// Kill any prior subprocess for the session and start a fresh one
    /// that resumes the conversation. Stdout still in flight from the
    /// superseded process must not be delivered.
    async fn resume(&self, launch: WorkerLaunch) -> Result<(), WorkerError>;

    /// Kill the running subprocess. Returns false when none is running.
    /// Unlike `resume`, the killed process's terminal close event is
    /// still delivered.
    async fn kill(&self, session_id: Uuid) -> Result<bool, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_line() {
        let event = WorkerEvent::parse(r#"{"type":"assistant","message":{"content":"hi"}}"#)
            .expect("parse");
        assert_eq!(event.event_type, "assistant");
        assert_eq!(event.data["message"]["content"], "hi");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(WorkerEvent::parse("plain log line").is_none());
        assert!(WorkerEvent::parse(r#"{"no_type":1}"#).is_none());
    }

    #[test]
    fn test_close_subtypes() {
        assert_eq!(WorkerEvent::close(Some(0)).subtype(), Some("close"));
        assert_eq!(WorkerEvent::close(Some(1)).subtype(), Some("error"));
        assert_eq!(WorkerEvent::close(None).subtype(), Some("error"));
        assert!(WorkerEvent::close(Some(0)).is_terminal());
    }

    #[test]
    fn test_synthetic_system_events() {
        let raw = WorkerEvent::system_raw("garbled");
        assert_eq!(raw.event_type, "system");
        assert_eq!(raw.data["content"], "garbled");

        let err = WorkerEvent::stderr("boom");
        assert_eq!(err.subtype(), Some("stderr"));
    }
}
