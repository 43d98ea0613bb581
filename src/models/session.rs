// ABOUTME: Session record persisted per agent session, with the status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
    Archived,
}

impl SessionStatus {
    pub fn indicator(&self) -> &'static str {
        match self {
            SessionStatus::Running => "●",
            SessionStatus::Paused => "⏸",
            SessionStatus::Stopped => "■",
            SessionStatus::Completed => "✓",
            SessionStatus::Error => "✗",
            SessionStatus::Archived => "▣",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }

    /// Running and paused sessions still own a live process.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Error
        )
    }

    /// Allowed edges:
    /// running -> {stopped, paused, completed, error}, paused -> running,
    /// terminal -> archived, archived -> completed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Running, Stopped | Paused | Completed | Error) => true,
            (Paused, Running) => true,
            (Stopped | Completed | Error, Archived) => true,
            (Archived, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub name: String,
    pub status: SessionStatus,
    pub pid: i32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    pub log_file: PathBuf,
    pub agent_state_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionState {
    /// A freshly launched record. The agent state file lives in the workspace
    /// so the detached process can reach it.
    pub fn new(name: String, command: Vec<String>, workspace: PathBuf, log_file: PathBuf) -> Self {
        let agent_state_file = workspace.join(".agent_state.json");
        Self {
            name,
            status: SessionStatus::Running,
            pid: 0,
            start_time: Utc::now(),
            end_time: None,
            command,
            workspace,
            log_file,
            agent_state_file,
            start_commit_sha: None,
            end_commit_sha: None,
            container_id: None,
            tags: Vec::new(),
            goal: None,
            error: None,
        }
    }

    /// Apply a status change, keeping `end_time` unset exactly while the
    /// session is running or paused.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        if status.is_active() {
            self.end_time = None;
        } else if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(
            "demo".to_string(),
            vec!["/bin/true".to_string()],
            PathBuf::from("/tmp/ws"),
            PathBuf::from("/tmp/demo.log"),
        )
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        use SessionStatus::*;
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));
        assert!(Paused.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Archived));
        assert!(Error.can_transition_to(Archived));
        assert!(Archived.can_transition_to(Completed));

        assert!(!Paused.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Archived));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Archived.can_transition_to(Running));
    }

    #[test]
    fn test_end_time_tracks_active_status() {
        let mut state = state();
        assert!(state.end_time.is_none());

        state.set_status(SessionStatus::Paused);
        assert!(state.end_time.is_none());

        state.set_status(SessionStatus::Stopped);
        let ended = state.end_time;
        assert!(ended.is_some());

        state.set_status(SessionStatus::Archived);
        assert_eq!(state.end_time, ended);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
