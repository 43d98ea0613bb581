// ABOUTME: Agent backed by a command line tool that reads the prompt on stdin and answers on stdout

use super::{Agent, AgentError, ChunkCallback, StatefulAgent};
use crate::models::{estimate_tokens, TokenUsage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub struct CliAgent {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    model: String,
    timeout: Duration,
    usage: Mutex<TokenUsage>,
}

impl CliAgent {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            model: String::new(),
            timeout: Duration::from_secs(600),
            usage: Mutex::new(TokenUsage::default()),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self) -> Result<Child, AgentError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| AgentError::Configuration("agent command is empty".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Configuration(format!("agent binary '{}' not found", program))
            } else {
                AgentError::Io(e)
            }
        })
    }

    /// Feed the prompt from a separate task so a chatty tool cannot fill its
    /// stdout pipe while we are still writing.
    fn write_prompt(child: &mut Child, prompt: &str) {
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                let written = async {
                    stdin.write_all(prompt.as_bytes()).await?;
                    stdin.shutdown().await
                };
                match written.await {
                    Ok(()) => {}
                    // Tools that ignore stdin may exit before reading it.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("Agent closed stdin early")
                    }
                    Err(e) => warn!("Failed to write prompt to agent: {}", e),
                }
            });
        }
    }

    async fn finish(&self, mut child: Child, prompt: &str, response: String) -> Result<String, AgentError> {
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            if let Err(e) = err.read_to_string(&mut stderr).await {
                warn!("Failed to read agent stderr: {}", e);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(AgentError::Transient(format!(
                "agent exited with {}: {}",
                status,
                stderr.trim()
            )));
        }

        self.record(prompt, &response);
        Ok(response)
    }

    fn record(&self, prompt: &str, response: &str) {
        let turn = TokenUsage::new(estimate_tokens(prompt), estimate_tokens(response));
        match self.usage.lock() {
            Ok(mut usage) => *usage += turn,
            Err(poisoned) => *poisoned.into_inner() += turn,
        }
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn send(&self, prompt: &str) -> Result<String, AgentError> {
        let mut child = self.spawn()?;
        Self::write_prompt(&mut child, prompt);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transient("agent stdout unavailable".to_string()))?;
        let mut response = String::new();
        tokio::time::timeout(self.timeout, stdout.read_to_string(&mut response))
            .await
            .map_err(|_| AgentError::Timeout)??;

        debug!("Agent returned {} bytes", response.len());
        self.finish(child, prompt, response).await
    }

    async fn send_stream(&self, prompt: &str, on_chunk: ChunkCallback<'_>) -> Result<String, AgentError> {
        let mut child = self.spawn()?;
        Self::write_prompt(&mut child, prompt);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transient("agent stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut response = String::new();

        let read_all = async {
            while let Some(line) = lines.next_line().await? {
                on_chunk(&line);
                response.push_str(&line);
                response.push('\n');
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::time::timeout(self.timeout, read_all)
            .await
            .map_err(|_| AgentError::Timeout)??;

        self.finish(child, prompt, response).await
    }

    fn as_stateful(&self) -> Option<&dyn StatefulAgent> {
        Some(self)
    }
}

impl StatefulAgent for CliAgent {
    fn model(&self) -> String {
        if self.model.is_empty() {
            self.argv.first().cloned().unwrap_or_default()
        } else {
            self.model.clone()
        }
    }

    fn take_usage(&self) -> TokenUsage {
        match self.usage.lock() {
            Ok(mut usage) => std::mem::take(&mut *usage),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}
