// ABOUTME: Persistence of the per-session agent state file written only by the owning session

use super::AgentError;
use crate::models::{AgentState, TokenUsage};
use chrono::Utc;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AgentStateStore {
    path: PathBuf,
}

impl AgentStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty state; an unreadable one is logged and
    /// treated the same way.
    pub fn load(&self) -> Result<AgentState, AgentError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!("Ignoring unreadable agent state {:?}: {}", self.path, e);
                    Ok(AgentState::default())
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(AgentState::default()),
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    pub fn save(&self, state: &AgentState) -> Result<(), AgentError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(state)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| AgentError::Io(e.error))?;
        Ok(())
    }

    /// Add one turn's usage to the cumulative totals.
    pub fn record_usage(&self, model: &str, usage: TokenUsage) -> Result<AgentState, AgentError> {
        let mut state = self.load()?;
        if !model.is_empty() {
            state.model = model.to_string();
        }
        state.token_usage += usage;
        state.updated_at = Some(Utc::now());
        self.save(&state)?;
        debug!(
            "Agent usage now {} tokens ({} prompt, {} response)",
            state.token_usage.total_tokens, state.token_usage.prompt_tokens, state.token_usage.response_tokens
        );
        Ok(state)
    }

    pub fn record_error(&self, error: &str) -> Result<(), AgentError> {
        let mut state = self.load()?;
        state.last_error = Some(error.to_string());
        state.updated_at = Some(Utc::now());
        self.save(&state)
    }
}
