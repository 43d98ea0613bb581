// ABOUTME: Git integration for session workspaces: checkpoint commits, branch handling and merges

pub mod client;

pub use client::{Git2Client, GitClient, GitError};

#[cfg(test)]
pub use client::MockGitClient;
