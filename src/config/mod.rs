// ABOUTME: Application configuration loaded once at the process boundary and passed down by value

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Could not determine home directory")]
    MissingHome,
}

/// Top-level configuration. Every field has a default so a partial
/// `config.toml` is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub sessions_dir: Option<PathBuf>,
    pub image: String,
    pub max_iterations: u32,
    pub manager_frequency: u32,
    pub max_parallel_tickets: usize,
    pub auto_merge: bool,
    pub skip_qa: bool,
    pub base_branch: Option<String>,
    pub stop_grace_period_secs: u64,
    pub transient_retries: u32,
    pub retry_backoff_ms: u64,
    pub command_timeout_secs: u64,
    pub max_noop_iterations: u32,
    pub container_user: Option<String>,
    pub agent_command: Vec<String>,
    pub stream_output: bool,
    /// Docker socket to use instead of the platform defaults.
    pub docker_socket: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sessions_dir: None,
            image: "agents-runner/agent:latest".to_string(),
            max_iterations: 20,
            manager_frequency: 5,
            max_parallel_tickets: 1,
            auto_merge: false,
            skip_qa: false,
            base_branch: None,
            stop_grace_period_secs: 2,
            transient_retries: 3,
            retry_backoff_ms: 1000,
            command_timeout_secs: 600,
            max_noop_iterations: 3,
            container_user: None,
            agent_command: vec!["claude".to_string(), "-p".to_string()],
            stream_output: false,
            docker_socket: None,
        }
    }
}

impl AppConfig {
    /// Root directory for everything the runner keeps on the host.
    pub fn home_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".agents-runner"))
            .ok_or(ConfigError::MissingHome)
    }

    /// Load `~/.agents-runner/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::home_dir()?.join("config.toml");
        if path.exists() {
            Self::load_from(&path)
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Invalid("image must not be empty".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be at least 1".to_string()));
        }
        if self.manager_frequency == 0 {
            return Err(ConfigError::Invalid("manager_frequency must be at least 1".to_string()));
        }
        if self.max_parallel_tickets == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_tickets must be at least 1".to_string(),
            ));
        }
        if self.agent_command.is_empty() {
            return Err(ConfigError::Invalid("agent_command must not be empty".to_string()));
        }
        Ok(())
    }

    /// Sessions directory, defaulting to `~/.agents-runner/sessions`.
    pub fn resolved_sessions_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.sessions_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::home_dir()?.join("sessions")),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            image: self.image.clone(),
            max_iterations: self.max_iterations,
            manager_frequency: self.manager_frequency,
            auto_merge: self.auto_merge,
            skip_qa: self.skip_qa,
            base_branch: self.base_branch.clone(),
            transient_retries: self.transient_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            max_noop_iterations: self.max_noop_iterations,
            container_user: self.container_user.clone(),
            stream_output: self.stream_output,
            binds: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            stop_grace_period: Duration::from_secs(self.stop_grace_period_secs),
        }
    }
}

/// Settings consumed by a single `AgentSession`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub image: String,
    pub max_iterations: u32,
    pub manager_frequency: u32,
    pub auto_merge: bool,
    pub skip_qa: bool,
    pub base_branch: Option<String>,
    pub transient_retries: u32,
    pub retry_backoff: Duration,
    pub command_timeout: Duration,
    pub max_noop_iterations: u32,
    pub container_user: Option<String>,
    pub stream_output: bool,
    pub binds: Vec<String>,
    pub env: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        AppConfig::default().session_config()
    }
}

/// Settings consumed by `SessionManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub stop_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        AppConfig::default().manager_config()
    }
}
