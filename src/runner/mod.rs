// ABOUTME: Per-session agent execution loop and the error taxonomy it reports

pub mod prompts;
pub mod response;
pub mod session;

pub use response::{ManagerDecision, TASK_COMPLETE, QA_PASSED};
pub use session::{AgentSession, SessionOutcome, SessionPhase};

use crate::agent::AgentError;
use crate::docker::ContainerError;
use crate::git::GitError;
use crate::session::SessionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    /// Missing paths, binaries or credentials. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A container or agent call kept failing after its retries.
    #[error("{0}")]
    Transient(String),
    #[error("reached max iterations ({0})")]
    MaxIterations(u32),
    #[error("no progress after {0} consecutive turns")]
    NoProgress(u32),
    #[error("manager aborted the session: {0}")]
    ManagerAborted(String),
    #[error(transparent)]
    Agent(AgentError),
    #[error(transparent)]
    Container(ContainerError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl From<AgentError> for RunnerError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Configuration(msg) => RunnerError::Configuration(msg),
            other => RunnerError::Agent(other),
        }
    }
}

impl From<ContainerError> for RunnerError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::InvalidConfig(msg) => RunnerError::Configuration(msg),
            other => RunnerError::Container(other),
        }
    }
}

impl RunnerError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, RunnerError::Configuration(_))
    }
}
