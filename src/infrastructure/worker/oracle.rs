//! Subprocess-backed oracle.
//!
//! Runs the worker binary in single-shot print mode with tools
//! disabled, accumulates assistant text from the stream-JSON stdout,
//! and falls back to the terminal result field when no assistant text
//! arrived. Transient spawn and exit failures are retried with
//! exponential backoff; the public call never fails, it reports
//! problems through `OracleReply::error`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use super::command::build_oracle_command;
use crate::domain::ports::oracle::{Oracle, OracleReply};
use crate::domain::ports::worker::WorkerEvent;
use crate::infrastructure::config::OracleConfig;

pub struct SubprocessOracle {
    binary: String,
    /// Any writable location; the oracle has no filesystem effects.
    working_dir: PathBuf,
    config: OracleConfig,
}

impl SubprocessOracle {
    pub fn new(binary: impl Into<String>, working_dir: impl Into<PathBuf>, config: OracleConfig) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
            config,
        }
    }

    async fn run_once(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
    ) -> Result<String, backoff::Error<String>> {
        let mut cmd = build_oracle_command(&self.binary, &self.working_dir, system_prompt, prompt);
        let mut child = cmd
            .spawn()
            .map_err(|e| backoff::Error::transient(format!("failed to spawn oracle: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| backoff::Error::permanent("no stdout handle".to_string()))?;
        let stderr = child.stderr.take();

        let work = async {
            let mut assistant = String::new();
            let mut result_fallback: Option<String> = None;

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Some(event) = WorkerEvent::parse(trimmed) else {
                    continue;
                };
                match event.event_type.as_str() {
                    "assistant" => append_assistant_text(&event.data, &mut assistant),
                    "result" => {
                        if let Some(result) = event.data.get("result").and_then(Value::as_str) {
                            result_fallback = Some(result.to_string());
                        }
                    }
                    _ => {}
                }
            }

            let mut errors = String::new();
            if let Some(stderr) = stderr {
                let _ = BufReader::new(stderr).read_to_string(&mut errors).await;
            }

            let status = child
                .wait()
                .await
                .map_err(|e| backoff::Error::transient(format!("failed to reap oracle: {e}")))?;
            if !status.success() {
                return Err(backoff::Error::transient(format!(
                    "oracle exited with {:?}: {}",
                    status.code(),
                    errors.trim()
                )));
            }

            let content = if assistant.trim().is_empty() {
                result_fallback.unwrap_or_default()
            } else {
                assistant
            };
            if content.trim().is_empty() {
                return Err(backoff::Error::permanent(
                    "oracle produced no content".to_string(),
                ));
            }
            Ok(content)
        };

        let outcome = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), work).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                Err(backoff::Error::permanent(format!(
                    "oracle timed out after {}s",
                    self.config.timeout_secs
                )))
            }
        }
    }
}

#[async_trait]
impl Oracle for SubprocessOracle {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> OracleReply {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_max_elapsed_secs)),
            ..ExponentialBackoff::default()
        };

        match backoff::future::retry(policy, || self.run_once(system_prompt, prompt)).await {
            Ok(content) => OracleReply::ok(content),
            Err(error) => {
                tracing::warn!(error = %error, "oracle completion failed");
                OracleReply::failed(error)
            }
        }
    }
}

/// Pull assistant text out of an `assistant` stream event. The message
/// content is either a plain string or a list of typed blocks.
fn append_assistant_text(data: &Value, out: &mut String) {
    let Some(content) = data.get("message").and_then(|m| m.get("content")) else {
        return;
    };
    match content {
        Value::String(text) => out.push_str(text),
        Value::Array(blocks) => {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assistant_text_string_content() {
        let data = serde_json::json!({ "message": { "content": "hello" } });
        let mut out = String::new();
        append_assistant_text(&data, &mut out);
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_append_assistant_text_block_content() {
        let data = serde_json::json!({
            "message": { "content": [
                { "type": "text", "text": "one " },
                { "type": "tool_use", "name": "Bash" },
                { "type": "text", "text": "two" },
            ] }
        });
        let mut out = String::new();
        append_assistant_text(&data, &mut out);
        assert_eq!(out, "one two");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_complete_against_stub_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("oracle.sh");
        let body = concat!(
            "#!/bin/sh\n",
            "echo \"{\\\"type\\\":\\\"assistant\\\",",
            "\\\"message\\\":{\\\"content\\\":\\\"forty-two\\\"}}\"\n",
            "echo \"{\\\"type\\\":\\\"result\\\",\\\"subtype\\\":\\\"success\\\",",
            "\\\"result\\\":\\\"forty-two\\\"}\"\n",
        );
        std::fs::write(&script, body).expect("write script");
        let mut perms = std::fs::metadata(&script).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");

        let oracle = SubprocessOracle::new(
            script.display().to_string(),
            dir.path(),
            OracleConfig {
                timeout_secs: 10,
                retry_max_elapsed_secs: 1,
            },
        );

        let reply = oracle.complete(None, "what is the answer?").await;
        assert!(reply.error.is_none(), "unexpected error: {:?}", reply.error);
        assert_eq!(reply.content, "forty-two");
    }
}
