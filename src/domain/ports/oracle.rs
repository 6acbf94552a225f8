//! Oracle port: request/response interface to a no-tool language model.

use async_trait::async_trait;

/// Reply from the oracle.
///
/// The call itself never fails; transport problems surface in `error`
/// with `content` left empty.
#[derive(Debug, Clone, Default)]
pub struct OracleReply {
    pub content: String,
    pub error: Option<String>,
}

impl OracleReply {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// A string-prompt-in, string-completion-out language model.
///
/// The oracle never invokes tools; it plans, evaluates, and answers on
/// behalf of the orchestrator.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> OracleReply;
}
