//! Git collaborator — commits the working tree after Prompt and Bash blocks.
//!
//! The interpreter only reports which block finished and where; remote,
//! branch and push policy live entirely in the collaborator.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::GitConfig;
use crate::models::BlockType;

/// Notification sent after a Prompt or Bash block completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCommit {
    pub block_type: BlockType,
    pub block_name: String,
    pub working_directory: PathBuf,
}

#[async_trait]
pub trait GitCollaborator: Send + Sync {
    /// Must not fail the run; implementations log their own errors.
    async fn block_completed(&self, commit: &BlockCommit);
}

/// Collaborator that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGit;

#[async_trait]
impl GitCollaborator for NoopGit {
    async fn block_completed(&self, _commit: &BlockCommit) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub success: bool,
    pub message: String,
    pub changes_detected: bool,
    pub pushed: bool,
    pub commit_hash: Option<String>,
}

/// Stages everything, commits with a block label and optionally pushes.
#[derive(Debug, Clone)]
pub struct GitAutoCommit {
    config: GitConfig,
}

impl GitAutoCommit {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    /// Synchronous commit; call from a blocking context.
    pub fn commit_block(&self, commit: &BlockCommit) -> CommitResult {
        let repo = commit.working_directory.as_path();
        if !is_git_repository(repo) {
            return CommitResult {
                message: format!("{} is not a git repository", repo.display()),
                ..CommitResult::default()
            };
        }

        if let Err(e) = run_git(repo, &["add", "-A"]) {
            return failed(format!("git add failed: {}", e));
        }

        match run_git(repo, &["status", "--porcelain"]) {
            Ok(status) if status.trim().is_empty() => {
                return CommitResult {
                    success: true,
                    message: "No changes to commit".to_string(),
                    ..CommitResult::default()
                };
            }
            Ok(_) => {}
            Err(e) => return failed(format!("git status failed: {}", e)),
        }

        let message = commit_message(commit.block_type, &commit.block_name, Local::now());
        if let Err(e) = run_git(repo, &["commit", "-m", &message]) {
            return CommitResult {
                changes_detected: true,
                ..failed(format!("git commit failed: {}", e))
            };
        }

        let commit_hash = run_git(repo, &["rev-parse", "--short", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut result = CommitResult {
            success: true,
            message,
            changes_detected: true,
            pushed: false,
            commit_hash,
        };

        if self.config.auto_push {
            let branch = self
                .config
                .branch
                .clone()
                .or_else(|| get_current_branch(repo));
            match branch {
                Some(branch) => match run_git(repo, &["push", &self.config.remote, &branch]) {
                    Ok(_) => result.pushed = true,
                    Err(e) => {
                        tracing::warn!("[Git] Push to {}/{} failed: {}", self.config.remote, branch, e)
                    }
                },
                None => tracing::warn!("[Git] Push skipped: no branch checked out"),
            }
        }

        result
    }
}

#[async_trait]
impl GitCollaborator for GitAutoCommit {
    async fn block_completed(&self, commit: &BlockCommit) {
        if !self.config.auto_commit {
            return;
        }
        let this = self.clone();
        let commit = commit.clone();
        match tokio::task::spawn_blocking(move || this.commit_block(&commit)).await {
            Ok(result) if result.success => {
                tracing::info!(
                    "[Git] {} {}",
                    result.message,
                    result.commit_hash.as_deref().unwrap_or("")
                );
            }
            Ok(result) => tracing::warn!("[Git] Auto-commit skipped: {}", result.message),
            Err(e) => tracing::warn!("[Git] Auto-commit task failed: {}", e),
        }
    }
}

/// `[Prompt] Write tests (2024-05-01 14:03:22)`
pub fn commit_message(block_type: BlockType, block_name: &str, at: DateTime<Local>) -> String {
    format!(
        "[{}] {} ({})",
        block_type.label(),
        block_name,
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn is_git_repository(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn get_current_branch(repo_path: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo_path)
        .output()
        .ok()?;
    if output.status.success() {
        let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if s.is_empty() || s == "HEAD" { None } else { Some(s) }
    } else {
        None
    }
}

fn run_git(repo_path: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

fn failed(message: String) -> CommitResult {
    CommitResult {
        message,
        ..CommitResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_commit_message_format() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 14, 3, 22).unwrap();
        assert_eq!(
            commit_message(BlockType::Prompt, "Write tests", at),
            "[Prompt] Write tests (2024-05-01 14:03:22)"
        );
        assert_eq!(
            commit_message(BlockType::Bash, "build", at),
            "[Bash] build (2024-05-01 14:03:22)"
        );
    }

    #[test]
    fn test_commit_outside_repository_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitAutoCommit::new(GitConfig::default());
        let result = git.commit_block(&BlockCommit {
            block_type: BlockType::Bash,
            block_name: "build".to_string(),
            working_directory: dir.path().to_path_buf(),
        });
        assert!(!result.success);
        assert!(!result.changes_detected);
        assert!(result.message.contains("not a git repository"));
    }

    #[tokio::test]
    async fn test_disabled_auto_commit_is_silent() {
        let git = GitAutoCommit::new(GitConfig::default());
        git.block_completed(&BlockCommit {
            block_type: BlockType::Prompt,
            block_name: "noop".to_string(),
            working_directory: PathBuf::from("/nonexistent"),
        })
        .await;
    }
}
