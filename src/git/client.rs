// ABOUTME: Git operations a session needs on its workspace: branches, checkpoint commits, diffs and merges
// Local object work goes through git2; push, checkout and merge shell out to the git CLI

use git2::{BranchType, IndexAddOption, Repository, ResetType, Signature};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Files the runner writes into a workspace that never belong in a commit.
const IGNORED_PATHS: &[&str] = &[".agent_state.json"];

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git repository error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid branch name: {0}")]
    InvalidBranchName(String),
    #[error("Command execution failed: {0}")]
    CommandFailed(String),
    #[error("Merge of {branch} failed: {message}")]
    MergeConflict { branch: String, message: String },
}

#[cfg_attr(test, mockall::automock)]
pub trait GitClient: Send + Sync {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), GitError>;

    /// Create `branch` from `base` (or HEAD) if missing and check it out.
    fn checkout_new_branch(&self, repo: &Path, branch: &str, base: Option<String>) -> Result<(), GitError>;

    fn checkout(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Stage everything and commit. Returns `None` when there was nothing to commit.
    fn commit(&self, repo: &Path, message: &str) -> Result<Option<String>, GitError>;

    fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// `--stat` summary of changes since `from`.
    fn diff(&self, repo: &Path, from: &str) -> Result<String, GitError>;

    fn tag(&self, repo: &Path, name: &str) -> Result<(), GitError>;

    fn current_commit_sha(&self, repo: &Path) -> Result<String, GitError>;

    fn current_branch(&self, repo: &Path) -> Result<String, GitError>;

    /// Merge `branch` into the checked-out branch; a failed merge is aborted.
    fn merge(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    fn reset_hard(&self, repo: &Path, sha: &str) -> Result<(), GitError>;
}

#[derive(Debug, Default, Clone)]
pub struct Git2Client;

impl Git2Client {
    pub fn new() -> Self {
        Self
    }

    fn validate_branch_name(&self, name: &str) -> Result<(), GitError> {
        if name.is_empty() {
            return Err(GitError::InvalidBranchName("Branch name cannot be empty".to_string()));
        }

        let invalid_chars = [' ', '~', '^', ':', '?', '*', '[', '\\'];
        if name.chars().any(|c| invalid_chars.contains(&c)) {
            return Err(GitError::InvalidBranchName(format!(
                "Branch name contains invalid characters: {}",
                name
            )));
        }

        if name.starts_with('-') || name.ends_with('/') || name.contains("//") || name.contains("..") {
            return Err(GitError::InvalidBranchName(format!("Invalid branch name format: {}", name)));
        }

        Ok(())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, GitError> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("agents-runner", "agents-runner@localhost")?),
        }
    }
}

/// Run a git subcommand in `repo` and return its trimmed stdout.
fn run_git(repo: &Path, args: &[&str]) -> Result<String, GitError> {
    debug!("git {} (in {})", args.join(" "), repo.display());
    let output = Command::new("git").current_dir(repo).args(args).output()?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            error.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl GitClient for Git2Client {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        info!("Cloning {} into {}", url, dest.display());
        Repository::clone(url, dest)?;
        Ok(())
    }

    fn checkout_new_branch(&self, repo_path: &Path, branch: &str, base: Option<String>) -> Result<(), GitError> {
        self.validate_branch_name(branch)?;
        let repo = Repository::open(repo_path)?;

        if repo.find_branch(branch, BranchType::Local).is_ok() {
            debug!("Branch {} already exists", branch);
        } else {
            let base_commit = match base.as_deref() {
                Some(base) => repo.find_branch(base, BranchType::Local)?.get().peel_to_commit()?,
                None => repo.head()?.peel_to_commit()?,
            };
            repo.branch(branch, &base_commit, false)?;
            info!("Created new branch: {} from {}", branch, base.as_deref().unwrap_or("HEAD"));
        }

        self.checkout(repo_path, branch)
    }

    fn checkout(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        run_git(repo, &["checkout", branch]).map(|_| ())
    }

    fn commit(&self, repo_path: &Path, message: &str) -> Result<Option<String>, GitError> {
        let repo = Repository::open(repo_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        for path in IGNORED_PATHS {
            // Absent from the index is fine.
            let _ = index.remove_path(Path::new(path));
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());

        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                debug!("Nothing to commit in {}", repo_path.display());
                return Ok(None);
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

        info!("Committed {} in {}: {}", oid, repo_path.display(), message);
        Ok(Some(oid.to_string()))
    }

    fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        run_git(repo, &["push", "-u", "origin", branch]).map(|_| ())
    }

    fn diff(&self, repo: &Path, from: &str) -> Result<String, GitError> {
        run_git(repo, &["diff", "--stat", from])
    }

    fn tag(&self, repo_path: &Path, name: &str) -> Result<(), GitError> {
        let repo = Repository::open(repo_path)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.tag_lightweight(name, head.as_object(), false)?;
        Ok(())
    }

    fn current_commit_sha(&self, repo_path: &Path) -> Result<String, GitError> {
        let repo = Repository::open(repo_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn current_branch(&self, repo_path: &Path) -> Result<String, GitError> {
        let repo = Repository::open(repo_path)?;
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    fn merge(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        if let Err(e) = run_git(repo, &["merge", "--no-ff", "--no-edit", branch]) {
            warn!("Merge of {} failed, aborting: {}", branch, e);
            if let Err(abort) = run_git(repo, &["merge", "--abort"]) {
                warn!("git merge --abort failed: {}", abort);
            }
            return Err(GitError::MergeConflict {
                branch: branch.to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    fn reset_hard(&self, repo_path: &Path, sha: &str) -> Result<(), GitError> {
        let repo = Repository::open(repo_path)?;
        let target = repo.revparse_single(sha)?;
        repo.reset(&target, ResetType::Hard, None)?;
        info!("Reset {} to {}", repo_path.display(), sha);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "Test User").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        std::fs::write(temp_dir.path().join("README.md"), "# Test Repo").unwrap();
        (temp_dir, repo)
    }

    #[test]
    fn test_commit_returns_none_when_clean() {
        let (temp_dir, _repo) = init_repo();
        let client = Git2Client::new();

        let first = client.commit(temp_dir.path(), "Initial commit").unwrap();
        assert!(first.is_some());
        assert_eq!(client.current_commit_sha(temp_dir.path()).unwrap(), first.unwrap());

        let second = client.commit(temp_dir.path(), "No changes").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_agent_state_file_is_not_committed() {
        let (temp_dir, repo) = init_repo();
        let client = Git2Client::new();
        client.commit(temp_dir.path(), "Initial commit").unwrap();

        std::fs::write(temp_dir.path().join(".agent_state.json"), "{}").unwrap();
        assert!(client.commit(temp_dir.path(), "state only").unwrap().is_none());

        let head_tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(head_tree.get_name(".agent_state.json").is_none());
    }

    #[test]
    fn test_new_branch_and_reset() {
        let (temp_dir, _repo) = init_repo();
        let client = Git2Client::new();
        let base = client.commit(temp_dir.path(), "Initial commit").unwrap().unwrap();

        client.checkout_new_branch(temp_dir.path(), "agent/work", None).unwrap();
        assert_eq!(client.current_branch(temp_dir.path()).unwrap(), "agent/work");

        std::fs::write(temp_dir.path().join("file.txt"), "change").unwrap();
        client.commit(temp_dir.path(), "change").unwrap().unwrap();
        assert!(client.diff(temp_dir.path(), &base).unwrap().contains("file.txt"));

        client.reset_hard(temp_dir.path(), &base).unwrap();
        assert_eq!(client.current_commit_sha(temp_dir.path()).unwrap(), base);
        assert!(!temp_dir.path().join("file.txt").exists());
    }

    #[test]
    fn test_invalid_branch_names() {
        let client = Git2Client::new();
        assert!(client.validate_branch_name("").is_err());
        assert!(client.validate_branch_name("has space").is_err());
        assert!(client.validate_branch_name("-leading").is_err());
        assert!(client.validate_branch_name("agent/ticket-1").is_ok());
    }
}
