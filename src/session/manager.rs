// ABOUTME: Session lifecycle manager: start, stop, pause, resume, remove, rename, archive and relaunch
// Composes the record store with the host process capability and reconciles stale records on read

use super::process::{ProcessHost, ProcessSignal, ResourceUsage, SpawnSpec};
use super::store::{validate_session_name, SessionStore};
use super::SessionError;
use crate::agent::AgentStateStore;
use crate::config::ManagerConfig;
use crate::git::GitClient;
use crate::models::{SessionState, SessionStatus, TokenUsage};
use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable carrying the session name into a detached process.
pub const SESSION_ENV: &str = "AGENTS_RUNNER_SESSION";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub name: String,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    pub goal: Option<String>,
    pub tags: Vec<String>,
}

impl StartRequest {
    pub fn new(name: impl Into<String>, command: Vec<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command,
            workspace: workspace.into(),
            goal: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

pub struct SessionManager {
    store: SessionStore,
    host: Arc<dyn ProcessHost>,
    git: Option<Arc<dyn GitClient>>,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(store: SessionStore, host: Arc<dyn ProcessHost>, config: ManagerConfig) -> Self {
        Self {
            store,
            host,
            git: None,
            config,
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitClient>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn is_process_running(&self, pid: i32) -> bool {
        self.host.is_running(pid)
    }

    fn workspace_sha(&self, workspace: &Path) -> Option<String> {
        let git = self.git.as_ref()?;
        match git.current_commit_sha(workspace) {
            Ok(sha) => Some(sha),
            Err(e) => {
                debug!("No commit SHA for {}: {}", workspace.display(), e);
                None
            }
        }
    }

    fn spawn(&self, name: &str, command: &[String], workspace: &Path, log_file: &Path) -> Result<i32, SessionError> {
        self.host.spawn_detached(&SpawnSpec {
            argv: command.to_vec(),
            cwd: workspace.to_path_buf(),
            log_file: log_file.to_path_buf(),
            env: vec![(SESSION_ENV.to_string(), name.to_string())],
        })
    }

    pub fn start_session(&self, request: StartRequest) -> Result<SessionState, SessionError> {
        validate_session_name(&request.name)?;
        if self.store.exists(&request.name) {
            return Err(SessionError::AlreadyExists(request.name));
        }
        if request.command.is_empty() {
            return Err(SessionError::Spawn("command is empty".to_string()));
        }

        let log_file = self.store.log_path(&request.name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_file)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    SessionError::AlreadyExists(request.name.clone())
                } else {
                    SessionError::Io(e)
                }
            })?;

        let start_sha = self.workspace_sha(&request.workspace);

        let pid = match self.spawn(&request.name, &request.command, &request.workspace, &log_file) {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&log_file) {
                    warn!("Failed to remove log {:?}: {}", log_file, cleanup);
                }
                return Err(e);
            }
        };

        let mut state = SessionState::new(request.name, request.command, request.workspace, log_file);
        state.pid = pid;
        state.goal = request.goal;
        state.tags = request.tags;
        state.start_commit_sha = start_sha;

        if let Err(e) = self.store.save(&state) {
            warn!("Failed to save session {}, killing process {}", state.name, pid);
            if let Err(kill_err) = self.host.signal(pid, ProcessSignal::Kill) {
                warn!("Failed to kill orphaned process {}: {}", pid, kill_err);
            }
            return Err(e);
        }

        info!("Started session {} (pid {})", state.name, pid);
        Ok(state)
    }

    /// A record still marked running whose process is gone is flipped to
    /// completed and saved.
    fn reconcile(&self, mut state: SessionState) -> SessionState {
        if state.status == SessionStatus::Running && !self.host.is_running(state.pid) {
            info!("Session {} (pid {}) is no longer running, marking completed", state.name, state.pid);
            state.set_status(SessionStatus::Completed);
            if state.end_commit_sha.is_none() {
                state.end_commit_sha = self.workspace_sha(&state.workspace);
            }
            if let Err(e) = self.store.save(&state) {
                warn!("Failed to save reconciled session {}: {}", state.name, e);
            }
        }
        state
    }

    pub fn get_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let state = self.store.load(name)?;
        Ok(self.reconcile(state))
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionState>, SessionError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|state| self.reconcile(state))
            .collect())
    }

    pub fn list_archived_sessions(&self) -> Result<Vec<SessionState>, SessionError> {
        self.store.list_archived()
    }

    fn transition(&self, state: &mut SessionState, to: SessionStatus) -> Result<(), SessionError> {
        if !state.status.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                name: state.name.clone(),
                from: state.status,
                to,
            });
        }
        state.set_status(to);
        Ok(())
    }

    /// Terminate gracefully, escalating to SIGKILL after the grace period.
    pub async fn stop_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let state = self.get_session(name)?;
        if state.status != SessionStatus::Running {
            return Err(SessionError::NotRunning(name.to_string()));
        }

        let pid = state.pid;
        info!("Stopping session {} (pid {})", name, pid);
        if let Err(e) = self.host.signal(pid, ProcessSignal::Terminate) {
            debug!("Terminate signal failed: {}", e);
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_grace_period;
        while self.host.is_running(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if self.host.is_running(pid) {
            warn!("Session {} did not exit within {:?}, killing", name, self.config.stop_grace_period);
            if let Err(e) = self.host.signal(pid, ProcessSignal::Kill) {
                warn!("Failed to kill process {}: {}", pid, e);
            }
        }

        // The process may have written its own final status while shutting down.
        let mut state = self.store.load(name)?;
        if state.status == SessionStatus::Running {
            self.transition(&mut state, SessionStatus::Stopped)?;
        }
        if state.end_commit_sha.is_none() {
            state.end_commit_sha = self.workspace_sha(&state.workspace);
        }
        self.store.save(&state)?;

        info!("Stopped session {}", name);
        Ok(state)
    }

    pub fn pause_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let mut state = self.get_session(name)?;
        if state.status.is_terminal() {
            return Err(SessionError::NotRunning(name.to_string()));
        }
        if state.status != SessionStatus::Running {
            return Err(SessionError::InvalidTransition {
                name: name.to_string(),
                from: state.status,
                to: SessionStatus::Paused,
            });
        }

        self.host.signal(state.pid, ProcessSignal::Stop)?;
        self.transition(&mut state, SessionStatus::Paused)?;
        self.store.save(&state)?;

        info!("Paused session {}", name);
        Ok(state)
    }

    pub fn resume_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let mut state = self.get_session(name)?;
        if state.status != SessionStatus::Paused {
            return Err(SessionError::InvalidTransition {
                name: name.to_string(),
                from: state.status,
                to: SessionStatus::Running,
            });
        }

        if !self.host.is_running(state.pid) {
            // Paused processes that died cannot come back.
            state.status = SessionStatus::Stopped;
            state.end_time = Some(Utc::now());
            self.store.save(&state)?;
            return Err(SessionError::NotRunning(name.to_string()));
        }

        self.host.signal(state.pid, ProcessSignal::Continue)?;
        self.transition(&mut state, SessionStatus::Running)?;
        self.store.save(&state)?;

        info!("Resumed session {}", name);
        Ok(state)
    }

    /// Delete the record and log. A live process blocks removal unless
    /// `force`, in which case it is killed first.
    pub fn remove_session(&self, name: &str, force: bool) -> Result<(), SessionError> {
        let state = self.store.load(name)?;

        if self.host.is_running(state.pid) {
            if !force {
                return Err(SessionError::RunningSession(name.to_string()));
            }
            info!("Force removing session {}, killing pid {}", name, state.pid);
            if let Err(e) = self.host.signal(state.pid, ProcessSignal::Kill) {
                warn!("Failed to kill process {}: {}", state.pid, e);
            }
        }

        self.store.delete(name, &state.log_file)?;
        info!("Removed session {}", name);
        Ok(())
    }

    /// Move a finished session's record and log to a new name.
    pub fn rename_session(&self, old: &str, new: &str) -> Result<SessionState, SessionError> {
        validate_session_name(new)?;
        let mut state = self.get_session(old)?;
        if state.status.is_active() {
            return Err(SessionError::RunningSession(old.to_string()));
        }
        if self.store.exists(new) {
            return Err(SessionError::AlreadyExists(new.to_string()));
        }

        self.store.rename(old, new)?;
        state.name = new.to_string();
        if state.log_file == self.store.log_path(old) {
            state.log_file = self.store.log_path(new);
        }
        self.store.save(&state)?;

        info!("Renamed session {} to {}", old, new);
        Ok(state)
    }

    pub fn archive_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let mut state = self.get_session(name)?;
        if state.status.is_active() {
            return Err(SessionError::RunningSession(name.to_string()));
        }
        if self.store.archived_exists(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }

        let previous = state.clone();
        self.transition(&mut state, SessionStatus::Archived)?;
        if state.log_file == self.store.log_path(name) {
            state.log_file = self.store.archived_dir().join(format!("{}.log", name));
        }
        self.store.save(&state)?;

        if let Err(e) = self.store.archive(name) {
            warn!("Failed to archive session {}, restoring record: {}", name, e);
            if let Err(restore) = self.store.save(&previous) {
                warn!("Failed to restore session {}: {}", name, restore);
            }
            return Err(e);
        }

        info!("Archived session {}", name);
        Ok(state)
    }

    pub fn unarchive_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let mut state = self.store.load_archived(name)?;
        self.transition(&mut state, SessionStatus::Completed)?;
        self.store.unarchive(name)?;

        state.log_file = self.store.log_path(name);
        self.store.save(&state)?;

        info!("Unarchived session {}", name);
        Ok(state)
    }

    fn restore_workspace(&self, workspace: &Path, sha: Option<&str>) -> Result<(), SessionError> {
        match (self.git.as_ref(), sha) {
            (Some(git), Some(sha)) => {
                git.reset_hard(workspace, sha)?;
                Ok(())
            }
            _ => {
                debug!("No checkpoint to restore for {}", workspace.display());
                Ok(())
            }
        }
    }

    /// Relaunch a finished session under the same name from its last
    /// checkpoint, appending to the existing log.
    pub fn restart_session(&self, name: &str) -> Result<SessionState, SessionError> {
        let mut state = self.get_session(name)?;
        if state.status.is_active() {
            return Err(SessionError::RunningSession(name.to_string()));
        }
        if state.status == SessionStatus::Archived {
            return Err(SessionError::InvalidTransition {
                name: name.to_string(),
                from: state.status,
                to: SessionStatus::Running,
            });
        }

        let checkpoint = state
            .end_commit_sha
            .clone()
            .or_else(|| state.start_commit_sha.clone());
        self.restore_workspace(&state.workspace, checkpoint.as_deref())?;

        {
            let mut log = OpenOptions::new().create(true).append(true).open(&state.log_file)?;
            writeln!(log, "--- restarted at {} ---", Utc::now().to_rfc3339())?;
        }

        let pid = self.spawn(name, &state.command, &state.workspace, &state.log_file)?;
        state.pid = pid;
        state.status = SessionStatus::Running;
        state.start_time = Utc::now();
        state.end_time = None;
        state.end_commit_sha = None;
        state.error = None;
        if checkpoint.is_some() {
            state.start_commit_sha = checkpoint;
        }
        self.store.save(&state)?;

        info!("Restarted session {} (pid {})", name, pid);
        Ok(state)
    }

    /// Start a fresh session running the same command against the workspace
    /// reset to the original starting point.
    pub fn replay_session(&self, name: &str, new_name: Option<&str>) -> Result<SessionState, SessionError> {
        let source = self
            .get_session(name)
            .or_else(|_| self.store.load_archived(name))?;
        if source.status.is_active() {
            return Err(SessionError::RunningSession(name.to_string()));
        }

        let replay_name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-replay", name));
        validate_session_name(&replay_name)?;
        if self.store.exists(&replay_name) {
            return Err(SessionError::AlreadyExists(replay_name));
        }

        self.restore_workspace(&source.workspace, source.start_commit_sha.as_deref())?;

        let mut request = StartRequest::new(replay_name, source.command.clone(), source.workspace.clone());
        request.goal = source.goal.clone();
        request.tags = source.tags.clone();
        self.start_session(request)
    }

    /// The last `lines` lines of the session log.
    pub fn session_logs(&self, name: &str, lines: usize) -> Result<Vec<String>, SessionError> {
        let state = self.store.load(name).or_else(|_| self.store.load_archived(name))?;
        let content = match std::fs::read_to_string(&state.log_file) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::Io(e)),
        };

        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|l| l.to_string()).collect())
    }

    /// Changes in the workspace since the session's starting commit.
    pub fn session_diff_stat(&self, name: &str) -> Result<Option<String>, SessionError> {
        let state = self.get_session(name)?;
        match (self.git.as_ref(), state.start_commit_sha.as_deref()) {
            (Some(git), Some(sha)) => Ok(Some(git.diff(&state.workspace, sha)?)),
            _ => Ok(None),
        }
    }

    pub fn resource_usage(&self, name: &str) -> Result<Option<ResourceUsage>, SessionError> {
        let state = self.get_session(name)?;
        if !state.status.is_active() {
            return Ok(None);
        }
        Ok(self.host.resource_usage(state.pid))
    }

    pub fn cost_summary(&self, name: &str) -> Result<CostSummary, SessionError> {
        let state = self.store.load(name).or_else(|_| self.store.load_archived(name))?;
        let agent_state = AgentStateStore::new(&state.agent_state_file).load()?;

        Ok(CostSummary {
            cost_usd: agent_state.cost(),
            model: agent_state.model,
            usage: agent_state.token_usage,
        })
    }
}
