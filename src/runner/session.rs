// ABOUTME: AgentSession execution loop: agent turns executed in a container, manager reviews, QA and checkpoints
// Cancellation is observed only between iterations; in-flight agent and container calls always finish

use super::prompts::{coding_prompt, manager_prompt, qa_prompt};
use super::response::{
    count_command_blocks, extract_command_blocks, has_signal, parse_manager_decision, truncate_output,
    CommandBlock, ManagerDecision, MAX_COMMAND_BLOCKS, QA_PASSED, TASK_COMPLETE,
};
use super::RunnerError;
use crate::agent::{Agent, AgentError, AgentStateStore};
use crate::config::SessionConfig;
use crate::docker::{ContainerError, ContainerRuntime, ContainerSpec};
use crate::git::GitClient;
use crate::models::{estimate_tokens, SessionState, SessionStatus, TokenUsage};
use crate::session::{SessionError, SessionStore};
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { iterations: u32 },
    Cancelled { iterations: u32 },
}

/// Errors that may clear up if the call is repeated.
trait Retryable: std::fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for AgentError {
    fn is_transient(&self) -> bool {
        AgentError::is_transient(self)
    }
}

impl Retryable for ContainerError {
    fn is_transient(&self) -> bool {
        ContainerError::is_transient(self)
    }
}

/// Results of running one response's command blocks.
#[derive(Debug, Default)]
struct TurnResult {
    feedback: String,
    executed: usize,
    failed: usize,
}

pub struct AgentSession {
    name: String,
    goal: String,
    workspace: PathBuf,
    config: SessionConfig,
    agent: Arc<dyn Agent>,
    manager_agent: Option<Arc<dyn Agent>>,
    qa_agent: Option<Arc<dyn Agent>>,
    runtime: Arc<dyn ContainerRuntime>,
    git: Option<Arc<dyn GitClient>>,
    store: Option<SessionStore>,
    agent_state: AgentStateStore,
    cancel: CancellationToken,
    branch: Option<String>,
    phase: SessionPhase,
    iteration: u32,
    container_id: Option<String>,
    noop_iterations: u32,
    feedback: String,
}

impl AgentSession {
    pub fn new(
        name: impl Into<String>,
        goal: impl Into<String>,
        workspace: impl Into<PathBuf>,
        agent: Arc<dyn Agent>,
        runtime: Arc<dyn ContainerRuntime>,
        config: SessionConfig,
    ) -> Self {
        let workspace = workspace.into();
        Self {
            name: name.into(),
            goal: goal.into(),
            agent_state: AgentStateStore::new(workspace.join(".agent_state.json")),
            workspace,
            config,
            agent,
            manager_agent: None,
            qa_agent: None,
            runtime,
            git: None,
            store: None,
            cancel: CancellationToken::new(),
            branch: None,
            phase: SessionPhase::Init,
            iteration: 0,
            container_id: None,
            noop_iterations: 0,
            feedback: String::new(),
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitClient>) -> Self {
        self.git = Some(git);
        self
    }

    /// Work on `branch`, created from the configured base branch if missing.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Keep the persisted session record with this name up to date.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_manager_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.manager_agent = Some(agent);
        self
    }

    pub fn with_qa_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.qa_agent = Some(agent);
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Drive the session to a terminal phase. Failures are returned as errors
    /// after the container is cleaned up and the session record updated.
    pub async fn run(&mut self) -> Result<SessionOutcome, RunnerError> {
        info!("Starting agent session {} in {}", self.name, self.workspace.display());
        self.phase = SessionPhase::Init;

        let result = match self.setup().await {
            Ok(()) => {
                self.phase = SessionPhase::Running;
                self.run_loop().await
            }
            Err(e) => Err(e),
        };

        self.phase = match &result {
            Ok(SessionOutcome::Completed { .. }) => SessionPhase::Completed,
            Ok(SessionOutcome::Cancelled { .. }) => SessionPhase::Cancelled,
            Err(_) => SessionPhase::Failed,
        };

        if let Some(container_id) = self.container_id.clone() {
            self.cleanup_container(&container_id).await;
        }
        self.finalize_record(&result);

        match &result {
            Ok(outcome) => info!("Agent session {} finished: {:?}", self.name, outcome),
            Err(e) => {
                error!("Agent session {} failed: {}", self.name, e);
                if let Err(state_err) = self.agent_state.record_error(&e.to_string()) {
                    warn!("Failed to record agent error: {}", state_err);
                }
            }
        }
        result
    }

    async fn setup(&mut self) -> Result<(), RunnerError> {
        if !self.workspace.is_dir() {
            return Err(RunnerError::Configuration(format!(
                "workspace {} does not exist",
                self.workspace.display()
            )));
        }

        if let (Some(git), Some(branch)) = (self.git.clone(), self.branch.clone()) {
            git.checkout_new_branch(&self.workspace, &branch, self.config.base_branch.clone())?;
        }
        let start_sha = self.current_sha();
        self.update_record(|state| {
            if state.start_commit_sha.is_none() {
                state.start_commit_sha = start_sha;
            }
        });

        let runtime = self.runtime.clone();
        let image = self.config.image.clone();
        let exists = self
            .with_retry("image check", || runtime.image_exists(&image))
            .await?;
        if !exists {
            self.with_retry("image pull", || runtime.pull_image(&image)).await?;
        }

        let spec = ContainerSpec {
            image: self.config.image.clone(),
            workspace: self.workspace.clone(),
            binds: self.config.binds.clone(),
            env: self.config.env.clone(),
            user: self.config.container_user.clone(),
            name: None,
        };
        let container_id = self
            .with_retry("container start", || runtime.run_container(&spec))
            .await?;
        info!("Session {} running in container {}", self.name, container_id);

        self.container_id = Some(container_id.clone());
        self.update_record(|state| state.container_id = Some(container_id));
        Ok(())
    }

    async fn run_loop(&mut self) -> Result<SessionOutcome, RunnerError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("Session {} cancelled after {} iterations", self.name, self.iteration);
                return Ok(SessionOutcome::Cancelled {
                    iterations: self.iteration,
                });
            }

            if self.iteration >= self.config.max_iterations {
                info!("Session {} reached max iterations ({})", self.name, self.config.max_iterations);
                return Err(RunnerError::MaxIterations(self.config.max_iterations));
            }

            self.iteration += 1;
            let manager_turn = self.iteration % self.config.manager_frequency.max(1) == 0;
            info!("Session {} iteration {} (manager: {})", self.name, self.iteration, manager_turn);

            let wants_completion = if manager_turn {
                self.manager_turn().await?
            } else {
                self.coding_turn().await?
            };

            if wants_completion && self.verify().await? {
                self.checkpoint();
                self.tag_completion();
                self.auto_merge();
                return Ok(SessionOutcome::Completed {
                    iterations: self.iteration,
                });
            }
        }
    }

    /// One agent turn. Returns true when the agent signalled completion.
    async fn coding_turn(&mut self) -> Result<bool, RunnerError> {
        let prompt = coding_prompt(&self.goal, self.iteration, self.config.max_iterations, &self.feedback);
        let agent = self.agent.clone();
        let response = self.send(&agent, &prompt).await?;

        let turn = self.execute_commands(&response).await?;
        let complete = has_signal(&response, TASK_COMPLETE);

        if turn.executed == 0 && !complete {
            self.noop_iterations += 1;
            warn!(
                "Session {} made no progress ({} consecutive turns)",
                self.name, self.noop_iterations
            );
            if self.noop_iterations >= self.config.max_noop_iterations {
                return Err(RunnerError::NoProgress(self.noop_iterations));
            }
            self.feedback = "No commands were found in your last response. \
                             Use ```bash blocks to act, or print TASK_COMPLETE if the goal is met."
                .to_string();
        } else {
            self.noop_iterations = 0;
            self.feedback = turn.feedback;
        }

        self.checkpoint();
        Ok(complete)
    }

    /// Periodic review. Returns true when the manager declared the work complete.
    async fn manager_turn(&mut self) -> Result<bool, RunnerError> {
        let recent = if self.feedback.is_empty() {
            "No activity recorded yet.".to_string()
        } else {
            self.feedback.clone()
        };
        let prompt = manager_prompt(&self.goal, self.iteration, self.config.max_iterations, &recent);
        let agent = self.manager_agent.clone().unwrap_or_else(|| self.agent.clone());
        let response = self.send(&agent, &prompt).await?;

        let turn = self.execute_commands(&response).await?;
        match parse_manager_decision(&response) {
            ManagerDecision::Complete => {
                info!("Manager declared session {} complete", self.name);
                Ok(true)
            }
            ManagerDecision::Abort(reason) => {
                warn!("Manager aborted session {}: {}", self.name, reason);
                Err(RunnerError::ManagerAborted(reason))
            }
            ManagerDecision::Continue => {
                let mut feedback = format!("Manager review:\n{}\n", response.trim());
                if !turn.feedback.is_empty() {
                    feedback.push_str(&turn.feedback);
                }
                self.feedback = feedback;
                Ok(false)
            }
        }
    }

    /// QA pass before declaring success, unless skipped.
    async fn verify(&mut self) -> Result<bool, RunnerError> {
        if self.config.skip_qa {
            debug!("Skipping QA for session {}", self.name);
            return Ok(true);
        }

        info!("Running QA for session {}", self.name);
        let agent = self.qa_agent.clone().unwrap_or_else(|| self.agent.clone());
        let response = self.send(&agent, &qa_prompt(&self.goal)).await?;
        let turn = self.execute_commands(&response).await?;

        let signalled = has_signal(&response, QA_PASSED) || has_signal(&turn.feedback, QA_PASSED);
        if signalled && turn.failed == 0 {
            info!("QA passed for session {}", self.name);
            return Ok(true);
        }

        warn!("QA did not pass for session {}", self.name);
        self.feedback = format!(
            "QA review did not pass. Fix the problems below before signalling completion again.\n{}\n{}",
            response.trim(),
            turn.feedback
        );
        Ok(false)
    }

    async fn send(&self, agent: &Arc<dyn Agent>, prompt: &str) -> Result<String, RunnerError> {
        let stream = self.config.stream_output;
        let response = self
            .with_retry("agent request", || async move {
                if stream {
                    agent.send_stream(prompt, &|chunk: &str| println!("{}", chunk)).await
                } else {
                    agent.send(prompt).await
                }
            })
            .await?;

        self.record_usage(agent.as_ref(), prompt, &response);
        Ok(response)
    }

    fn record_usage(&self, agent: &dyn Agent, prompt: &str, response: &str) {
        let (model, usage) = match agent.as_stateful() {
            Some(stateful) => (stateful.model(), stateful.take_usage()),
            None => (
                String::new(),
                TokenUsage::new(estimate_tokens(prompt), estimate_tokens(response)),
            ),
        };
        if let Err(e) = self.agent_state.record_usage(&model, usage) {
            warn!("Failed to record token usage for {}: {}", self.name, e);
        }
    }

    /// Run every command block in the response and collect their output as
    /// feedback for the next turn.
    async fn execute_commands(&self, response: &str) -> Result<TurnResult, RunnerError> {
        let total = count_command_blocks(response);
        if total > MAX_COMMAND_BLOCKS {
            warn!("Response had {} command blocks, running the first {}", total, MAX_COMMAND_BLOCKS);
        }

        let container_id = self
            .container_id
            .clone()
            .ok_or_else(|| RunnerError::Configuration("no container for session".to_string()))?;
        let timeout = self.config.command_timeout;
        let mut result = TurnResult::default();

        for (index, block) in extract_command_blocks(response).into_iter().enumerate() {
            let script = match block {
                CommandBlock::Json(data) => {
                    warn!("Skipping JSON block {}: {}", index + 1, data.chars().take(50).collect::<String>());
                    let _ = writeln!(result.feedback, "\n[Skipped JSON Block {} - Use 'cat' to write files]", index + 1);
                    continue;
                }
                CommandBlock::Script(script) => script,
            };

            debug!("Executing block {}: {}", index + 1, script);
            result.executed += 1;

            let runtime = self.runtime.clone();
            let exec = self
                .with_retry("command exec", || {
                    let runtime = runtime.clone();
                    let container_id = container_id.clone();
                    let script = script.clone();
                    async move {
                        match tokio::time::timeout(timeout, runtime.exec(&container_id, &script)).await {
                            Ok(output) => output.map(Some),
                            Err(_) => Ok(None),
                        }
                    }
                })
                .await?;

            match exec {
                None => {
                    result.failed += 1;
                    let _ = writeln!(
                        result.feedback,
                        "Command Failed: {}\nError: Command timed out after {} seconds.\n",
                        script,
                        timeout.as_secs()
                    );
                }
                Some(output) if output.success() => {
                    let _ = writeln!(result.feedback, "Command Output:\n{}", truncate_output(&output.output));
                }
                Some(output) => {
                    result.failed += 1;
                    let _ = writeln!(
                        result.feedback,
                        "Command Failed: {}\nError: exit code {}\nOutput:\n{}",
                        script,
                        output.exit_code.unwrap_or(-1),
                        truncate_output(&output.output)
                    );
                }
            }
        }

        Ok(result)
    }

    /// Repeat `op` on transient failures with linear backoff.
    async fn with_retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RunnerError>
    where
        E: Retryable + Into<RunnerError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.config.transient_retries + 1;
        let mut attempt = 1;
        loop {
            let message = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e.into()),
                Err(e) => e.to_string(),
            };

            if attempt >= attempts {
                return Err(RunnerError::Transient(format!(
                    "{} failed after {} attempts: {}",
                    what, attempts, message
                )));
            }

            warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, message);
            tokio::time::sleep(self.config.retry_backoff * attempt).await;
            attempt += 1;
        }
    }

    fn current_sha(&self) -> Option<String> {
        let git = self.git.as_ref()?;
        git.current_commit_sha(&self.workspace).ok()
    }

    fn checkpoint(&self) {
        let Some(git) = &self.git else { return };
        let message = format!("checkpoint: {} iteration {}", self.name, self.iteration);
        match git.commit(&self.workspace, &message) {
            Ok(Some(sha)) => {
                debug!("Checkpoint {} for session {}", sha, self.name);
                self.update_record(|state| state.end_commit_sha = Some(sha));
            }
            Ok(None) => {}
            Err(e) => warn!("Checkpoint commit failed for session {}: {}", self.name, e),
        }
    }

    fn tag_completion(&self) {
        let Some(git) = &self.git else { return };
        let tag = format!("agents-runner/{}", self.name);
        if let Err(e) = git.tag(&self.workspace, &tag) {
            warn!("Failed to tag completed session {}: {}", self.name, e);
        }
    }

    /// Merge the session branch into the base branch and push it. Failures
    /// leave the work on the session branch and are recorded, not fatal.
    fn auto_merge(&self) {
        if !self.config.auto_merge {
            return;
        }
        let Some(git) = &self.git else {
            debug!("Auto-merge needs a git workspace");
            return;
        };
        let Some(base) = self.config.base_branch.clone() else {
            warn!("Auto-merge enabled but no base branch configured");
            return;
        };
        let branch = match &self.branch {
            Some(branch) => branch.clone(),
            None => match git.current_branch(&self.workspace) {
                Ok(branch) => branch,
                Err(e) => {
                    warn!("Cannot auto-merge, current branch unknown: {}", e);
                    return;
                }
            },
        };
        if branch == base {
            debug!("Session {} already works on {}, nothing to merge", self.name, base);
            return;
        }

        info!("Merging {} into {}", branch, base);
        let merged = git
            .checkout(&self.workspace, &base)
            .and_then(|_| git.merge(&self.workspace, &branch))
            .and_then(|_| git.push(&self.workspace, &base));

        if let Err(e) = git.checkout(&self.workspace, &branch) {
            warn!("Failed to return to branch {}: {}", branch, e);
        }

        if let Err(e) = merged {
            warn!("Auto-merge of {} failed: {}", branch, e);
            let message = format!("auto-merge failed: {}", e);
            self.update_record(|state| state.error = Some(message));
        }
    }

    async fn cleanup_container(&self, container_id: &str) {
        info!("Cleaning up container {}", container_id);
        if let Err(e) = self.runtime.stop_container(container_id).await {
            warn!("Failed to stop container {}: {}", container_id, e);
        }
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
    }

    fn finalize_record(&self, result: &Result<SessionOutcome, RunnerError>) {
        let end_sha = self.current_sha();
        let (status, message) = match result {
            Ok(SessionOutcome::Completed { .. }) => (SessionStatus::Completed, None),
            Ok(SessionOutcome::Cancelled { .. }) => (SessionStatus::Stopped, None),
            Err(e) => (SessionStatus::Error, Some(e.to_string())),
        };

        self.update_record(|state| {
            if state.status.can_transition_to(status) {
                state.set_status(status);
            }
            if message.is_some() {
                state.error = message;
            }
            if end_sha.is_some() {
                state.end_commit_sha = end_sha;
            }
        });
    }

    /// Apply `f` to this session's persisted record, if there is one.
    fn update_record(&self, f: impl FnOnce(&mut SessionState)) {
        let Some(store) = &self.store else { return };
        match store.load(&self.name) {
            Ok(mut state) => {
                f(&mut state);
                if let Err(e) = store.save(&state) {
                    warn!("Failed to save session {}: {}", self.name, e);
                }
            }
            Err(SessionError::NotFound(_)) => debug!("No session record for {}", self.name),
            Err(e) => warn!("Failed to load session {}: {}", self.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChunkCallback;
    use crate::docker::{ExecOutput, MockContainerRuntime};
    use crate::git::{GitError, MockGitClient};
    use async_trait::async_trait;
    use mockall::predicate::{always, eq};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Scripted(Mutex<VecDeque<&'static str>>);

    #[async_trait]
    impl Agent for Scripted {
        async fn send(&self, _prompt: &str) -> Result<String, AgentError> {
            Ok(self.0.lock().unwrap().pop_front().unwrap_or("").to_string())
        }

        async fn send_stream(&self, prompt: &str, _on_chunk: ChunkCallback<'_>) -> Result<String, AgentError> {
            self.send(prompt).await
        }
    }

    fn runtime() -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_image_exists().returning(|_| Ok(true));
        runtime
            .expect_run_container()
            .returning(|_| Ok("c-1".to_string()));
        runtime.expect_exec().returning(|_, _| {
            Ok(ExecOutput {
                output: "ok".to_string(),
                exit_code: Some(0),
            })
        });
        runtime.expect_stop_container().returning(|_| Ok(()));
        runtime.expect_remove_container().returning(|_, _| Ok(()));
        runtime
    }

    fn config() -> SessionConfig {
        SessionConfig {
            skip_qa: true,
            manager_frequency: 100,
            base_branch: Some("main".to_string()),
            retry_backoff: Duration::from_millis(1),
            ..SessionConfig::default()
        }
    }

    fn agent(responses: &[&'static str]) -> Arc<dyn Agent> {
        Arc::new(Scripted(Mutex::new(responses.iter().copied().collect())))
    }

    fn git_basics(git: &mut MockGitClient) {
        git.expect_checkout_new_branch()
            .with(always(), eq("agent/T-1"), eq(Some("main".to_string())))
            .times(1)
            .returning(|_, _, _| Ok(()));
        git.expect_current_commit_sha()
            .returning(|_| Ok("abc123".to_string()));
        git.expect_tag()
            .with(always(), eq("agents-runner/demo"))
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn test_each_iteration_is_checkpointed() {
        let temp_dir = TempDir::new().unwrap();
        let mut git = MockGitClient::new();
        git_basics(&mut git);
        git.expect_commit()
            .withf(|_, message| message.starts_with("checkpoint: demo iteration "))
            .times(3)
            .returning(|_, _| Ok(Some("def456".to_string())));

        let mut session = AgentSession::new(
            "demo",
            "goal",
            temp_dir.path(),
            agent(&["```bash\nls\n```", "```bash\nmake\n```\nTASK_COMPLETE"]),
            Arc::new(runtime()),
            config(),
        )
        .with_git(Arc::new(git))
        .with_branch("agent/T-1");

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Completed { iterations: 2 });
    }

    #[tokio::test]
    async fn test_auto_merge_failure_does_not_fail_the_session() {
        let temp_dir = TempDir::new().unwrap();
        let mut git = MockGitClient::new();
        git_basics(&mut git);
        git.expect_commit().returning(|_, _| Ok(None));
        git.expect_checkout().returning(|_, _| Ok(()));
        git.expect_merge()
            .with(always(), eq("agent/T-1"))
            .times(1)
            .returning(|_, branch| {
                Err(GitError::MergeConflict {
                    branch: branch.to_string(),
                    message: "conflict in src/lib.rs".to_string(),
                })
            });
        git.expect_push().times(0);

        let store = SessionStore::new(temp_dir.path().join("sessions")).unwrap();
        let record = SessionState::new(
            "demo".to_string(),
            vec!["agents-runner".to_string()],
            temp_dir.path().to_path_buf(),
            store.log_path("demo"),
        );
        store.save(&record).unwrap();

        let mut session = AgentSession::new(
            "demo",
            "goal",
            temp_dir.path(),
            agent(&["```bash\nmake\n```\nTASK_COMPLETE"]),
            Arc::new(runtime()),
            SessionConfig {
                auto_merge: true,
                ..config()
            },
        )
        .with_git(Arc::new(git))
        .with_branch("agent/T-1")
        .with_store(store.clone());

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Completed { iterations: 1 });

        let saved = store.load("demo").unwrap();
        assert_eq!(saved.status, SessionStatus::Completed);
        assert_eq!(saved.start_commit_sha.as_deref(), Some("abc123"));
        assert!(saved.error.unwrap().starts_with("auto-merge failed"));
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled() {
        let temp_dir = TempDir::new().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_image_exists().returning(|_| Ok(false));
        runtime
            .expect_pull_image()
            .with(eq("agents-runner/agent:latest"))
            .times(1)
            .returning(|_| Ok(()));
        runtime
            .expect_run_container()
            .withf(|spec| spec.image == "agents-runner/agent:latest" && spec.name.is_none())
            .returning(|_| Ok("c-2".to_string()));
        runtime.expect_exec().returning(|_, _| {
            Ok(ExecOutput {
                output: String::new(),
                exit_code: Some(0),
            })
        });
        runtime.expect_stop_container().returning(|_| Ok(()));
        runtime
            .expect_remove_container()
            .with(eq("c-2"), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut session = AgentSession::new(
            "demo",
            "goal",
            temp_dir.path(),
            agent(&["```bash\ntrue\n```\nTASK_COMPLETE"]),
            Arc::new(runtime),
            config(),
        );
        session.run().await.unwrap();
        assert_eq!(session.container_id(), Some("c-2"));
    }
}
