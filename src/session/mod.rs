// ABOUTME: Session supervision: durable per-session records, OS process control and the lifecycle manager
// Records live as JSON files under the sessions directory; archived ones under archived/

pub mod manager;
pub mod process;
pub mod store;

pub use manager::{CostSummary, SessionManager, StartRequest};
pub use process::{OsProcessHost, ProcessHost, ProcessSignal, ResourceUsage, SpawnSpec};
pub use store::{validate_session_name, SessionStore};

use crate::models::SessionStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidName(String),
    #[error("session '{0}' is not running")]
    NotRunning(String),
    #[error("session '{0}' is still running (use force to override)")]
    RunningSession(String),
    #[error("session '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("failed to spawn session process: {0}")]
    Spawn(String),
    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: i32, message: String },
    #[error("agent state error: {0}")]
    Agent(#[from] crate::agent::AgentError),
    #[error("git error: {0}")]
    Git(#[from] crate::git::GitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
