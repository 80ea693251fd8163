//! Language-model collaborator: one prompt in, one reply out.

mod completions;

pub use completions::{ChatCompletionsClient, DEFAULT_BASE_URL, DEFAULT_MODEL};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Network failure or non-success status.
    #[error("llm transport error: {0}")]
    Transport(String),
    /// Response arrived but had no usable reply.
    #[error("llm response format error: {0}")]
    Format(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LlmError::Format(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}
