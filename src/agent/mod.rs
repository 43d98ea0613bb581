// ABOUTME: Agent capability consumed by the execution loop, plus the optional token-accounting capability
// Concrete LLM clients live outside this crate; CliAgent drives any prompt-on-stdin command line tool

pub mod cli;
pub mod state;

pub use cli::CliAgent;
pub use state::AgentStateStore;

use crate::models::TokenUsage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Missing binary, credentials or other setup problems. Never retried.
    #[error("agent configuration error: {0}")]
    Configuration(String),
    #[error("agent request failed: {0}")]
    Transient(String),
    #[error("agent request timed out")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_) | AgentError::Timeout)
    }
}

/// Chunk callback for streamed responses.
pub type ChunkCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait Agent: Send + Sync {
    async fn send(&self, prompt: &str) -> Result<String, AgentError>;

    /// Like `send`, but hands each chunk to `on_chunk` as it arrives and
    /// still returns the full text.
    async fn send_stream(&self, prompt: &str, on_chunk: ChunkCallback<'_>) -> Result<String, AgentError>;

    /// Agents that track their own token usage expose it here.
    fn as_stateful(&self) -> Option<&dyn StatefulAgent> {
        None
    }
}

/// Optional capability for agents that know their model and real token counts.
/// The owning session drains usage after each turn and stays the only writer
/// of the persisted agent state.
pub trait StatefulAgent: Send + Sync {
    fn model(&self) -> String;

    /// Usage accumulated since the previous call.
    fn take_usage(&self) -> TokenUsage;
}
