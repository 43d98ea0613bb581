// ABOUTME: Ticket source capability for batch mode plus a JSON file backed implementation
// Issue trackers are external; FileTicketSource keeps tickets in a local JSON array

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const STATUS_IN_PROGRESS: &str = "In Progress";
pub const STATUS_DONE: &str = "Done";

lazy_static! {
    static ref REPO_LINE: Regex = Regex::new(r"(?im)^\s*Repo:\s*(\S+)").unwrap();
}

#[derive(Error, Debug)]
pub enum TicketError {
    #[error("ticket '{0}' not found")]
    NotFound(String),
    #[error("failed to read tickets from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse tickets: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ticket source error: {0}")]
    Source(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl Issue {
    pub fn new(key: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            summary: summary.into(),
            description: String::new(),
            status: String::new(),
            labels: Vec::new(),
            blocked_by: Vec::new(),
        }
    }

    /// Whether this issue satisfies a selector: `label:<name>`, free text
    /// matched against key, summary and description, or empty for everything.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return true;
        }
        if let Some(label) = query.strip_prefix("label:") {
            return self.labels.iter().any(|l| l.eq_ignore_ascii_case(label.trim()));
        }
        let needle = query.to_lowercase();
        self.key.to_lowercase().contains(&needle)
            || self.summary.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
    }

    /// Repository named by a `Repo: <url>` line in the description.
    pub fn repo_url(&self) -> Option<String> {
        let url = REPO_LINE.captures(&self.description)?[1].to_string();
        if url.starts_with("http") {
            Some(url.trim_end_matches(".git").to_string())
        } else {
            Some(url)
        }
    }

    /// Goal text handed to the agent for this ticket.
    pub fn goal(&self) -> String {
        if self.description.trim().is_empty() {
            format!("{}: {}", self.key, self.summary)
        } else {
            format!("{}: {}\n\n{}", self.key, self.summary, self.description)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, TicketError>;

    async fn get_ticket(&self, id: &str) -> Result<Issue, TicketError>;

    /// Keys of the tickets blocking `issue`, in or out of the current batch.
    async fn get_blockers(&self, issue: &Issue) -> Result<Vec<String>, TicketError>;

    async fn transition(&self, id: &str, status: &str) -> Result<(), TicketError>;
}

pub struct FileTicketSource {
    path: PathBuf,
    issues: Mutex<Vec<Issue>>,
}

impl FileTicketSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TicketError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| TicketError::Io {
            path: path.clone(),
            source,
        })?;
        let issues: Vec<Issue> = serde_json::from_str(&content)?;
        info!("Loaded {} tickets from {}", issues.len(), path.display());

        Ok(Self {
            path,
            issues: Mutex::new(issues),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, issues: &[Issue]) -> Result<(), TicketError> {
        let io_err = |source| TicketError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&serde_json::to_vec_pretty(issues)?).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl TicketSource for FileTicketSource {
    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, TicketError> {
        let issues = self.issues.lock().await;
        Ok(issues.iter().filter(|i| i.matches(query)).cloned().collect())
    }

    async fn get_ticket(&self, id: &str) -> Result<Issue, TicketError> {
        let issues = self.issues.lock().await;
        issues
            .iter()
            .find(|i| i.key == id)
            .cloned()
            .ok_or_else(|| TicketError::NotFound(id.to_string()))
    }

    async fn get_blockers(&self, issue: &Issue) -> Result<Vec<String>, TicketError> {
        Ok(issue.blocked_by.clone())
    }

    async fn transition(&self, id: &str, status: &str) -> Result<(), TicketError> {
        let mut issues = self.issues.lock().await;
        let issue = issues
            .iter_mut()
            .find(|i| i.key == id)
            .ok_or_else(|| TicketError::NotFound(id.to_string()))?;
        issue.status = status.to_string();
        debug!("Ticket {} -> {}", id, status);
        self.persist(&issues)
    }
}
