// ABOUTME: Container runtime capability the agent loop executes commands through

use super::ContainerError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Mount point of the session workspace inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub workspace: PathBuf,
    /// Extra `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub user: Option<String>,
    pub name: Option<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            workspace: workspace.into(),
            binds: Vec::new(),
            env: Vec::new(),
            user: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr.
    pub output: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError>;

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Create and start a long-lived container for a session, returning its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Run a shell command in the workspace of a running container.
    async fn exec(&self, container_id: &str, command: &str) -> Result<ExecOutput, ContainerError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), ContainerError>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), ContainerError>;
}
