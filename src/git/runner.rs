use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PilotError, Result};

pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn with_dir(&self, dir: &Path) -> Self {
        Self::new(dir)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(output)
    }

    pub async fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Returns `false` when there was nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool> {
        let output = self.run(&["commit", "-m", message]).await?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(false);
            }
            return Err(PilotError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(true)
    }

    pub async fn head(&self) -> Result<String> {
        let output = self.run_checked(&["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch]).await?;
        Ok(())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| PilotError::workspace("invalid path encoding", path))?;

        let output = if self.branch_exists(branch).await? {
            self.run(&["worktree", "add", path_str, branch]).await?
        } else {
            self.run(&["worktree", "add", "-b", branch, path_str, base])
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::workspace(stderr.trim(), path));
        }

        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| PilotError::workspace("invalid path encoding", path))?;

        let output = self
            .run(&["worktree", "remove", "--force", path_str])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::workspace(stderr.trim(), path));
        }

        Ok(())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).await?;
        Ok(())
    }
}

pub struct GhRunner {
    working_dir: PathBuf,
}

impl GhRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output> {
        let dir = dir.unwrap_or(&self.working_dir);
        debug!(args = ?args, dir = %dir.display(), "Running gh command");

        let output = Command::new("gh")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| PilotError::CodeHost(format!("failed to run gh: {}", e)))?;

        Ok(output)
    }

    pub async fn issue_view(&self, number: u64) -> Result<String> {
        let number = number.to_string();
        let output = self
            .run(None, &["issue", "view", &number, "--json", "title,body"])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::CodeHost(format!(
                "Failed to fetch issue #{}: {}",
                number,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn create_pr(
        &self,
        dir: &Path,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
        reviewers: &[String],
    ) -> Result<String> {
        let mut args = vec![
            "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
        ];

        let reviewer_args: Vec<String> = reviewers
            .iter()
            .flat_map(|r| vec!["--reviewer".to_string(), r.clone()])
            .collect();
        args.extend(reviewer_args.iter().map(|s| s.as_str()));

        let output = self.run(Some(dir), &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A resumed publish may find its pull request already open.
            if stderr.contains("already exists")
                && let Some(url) = extract_url(&stderr)
            {
                return Ok(url);
            }
            return Err(PilotError::CodeHost(format!(
                "Failed to create PR: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(extract_url(&stdout).unwrap_or_else(|| stdout.trim().to_string()))
    }
}

fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|w| w.starts_with("https://") || w.starts_with("http://"))
        .map(|w| w.trim_end_matches(['.', ',']).to_string())
}
