use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{DiffStatsFormat, Oid, Repository, Sort};
use tracing::debug;

use super::GitRunner;
use crate::error::{PilotError, Result};
use crate::run::Commit;

/// Version-control operations the orchestrator needs on a run's workspace.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()>;

    async fn worktree_remove(&self, path: &Path) -> Result<()>;

    /// Files changed between the merge base of `base` and `head`, and `head`.
    async fn changed_files(&self, workspace: &Path, base: &str, head: &str) -> Result<Vec<String>>;

    /// Commits reachable from `head` but not from `base`, oldest first.
    async fn commits(&self, workspace: &Path, base: &str, head: &str) -> Result<Vec<Commit>>;

    async fn diff_stat(&self, workspace: &Path, base: &str, head: &str) -> Result<String>;

    /// Stage everything and commit. `None` when the tree was clean.
    async fn commit(&self, workspace: &Path, message: &str) -> Result<Option<Commit>>;

    async fn push(&self, workspace: &Path, branch: &str) -> Result<()>;
}

/// `git` CLI for mutations, libgit2 for read-only queries.
pub struct GitVcs {
    git: GitRunner,
    remote: String,
}

impl GitVcs {
    pub fn new(repo_root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            git: GitRunner::new(repo_root),
            remote: remote.into(),
        }
    }

    async fn query<T, F>(workspace: &Path, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T> + Send + 'static,
    {
        let workspace = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&workspace)?;
            f(&repo)
        })
        .await
        .map_err(|e| PilotError::Other(format!("git query task failed: {}", e)))?
    }
}

fn resolve(repo: &Repository, spec: &str) -> Result<Oid> {
    Ok(repo.revparse_single(spec)?.peel_to_commit()?.id())
}

fn merge_base_diff<'r>(repo: &'r Repository, base: &str, head: &str) -> Result<git2::Diff<'r>> {
    let base_oid = resolve(repo, base)?;
    let head_oid = resolve(repo, head)?;
    let merge_base = repo.merge_base(base_oid, head_oid)?;

    let base_tree = repo.find_commit(merge_base)?.tree()?;
    let head_tree = repo.find_commit(head_oid)?.tree()?;
    Ok(repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?)
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        self.git.worktree_add(path, branch, base).await
    }

    async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let result = self.git.worktree_remove(path).await;
        self.git.worktree_prune().await?;
        result
    }

    async fn changed_files(&self, workspace: &Path, base: &str, head: &str) -> Result<Vec<String>> {
        let (base, head) = (base.to_string(), head.to_string());
        Self::query(workspace, move |repo| {
            let diff = merge_base_diff(repo, &base, &head)?;
            let files: BTreeSet<String> = diff
                .deltas()
                .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            Ok(files.into_iter().collect())
        })
        .await
    }

    async fn commits(&self, workspace: &Path, base: &str, head: &str) -> Result<Vec<Commit>> {
        let (base, head) = (base.to_string(), head.to_string());
        Self::query(workspace, move |repo| {
            let mut walk = repo.revwalk()?;
            walk.push(resolve(repo, &head)?)?;
            walk.hide(resolve(repo, &base)?)?;
            walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

            let mut commits = Vec::new();
            for oid in walk {
                let oid = oid?;
                let commit = repo.find_commit(oid)?;
                commits.push(Commit {
                    id: oid.to_string(),
                    message: commit.summary().unwrap_or_default().to_string(),
                });
            }
            Ok(commits)
        })
        .await
    }

    async fn diff_stat(&self, workspace: &Path, base: &str, head: &str) -> Result<String> {
        let (base, head) = (base.to_string(), head.to_string());
        Self::query(workspace, move |repo| {
            let diff = merge_base_diff(repo, &base, &head)?;
            let buf = diff.stats()?.to_buf(DiffStatsFormat::FULL, 80)?;
            Ok(buf.as_str().unwrap_or_default().to_string())
        })
        .await
    }

    async fn commit(&self, workspace: &Path, message: &str) -> Result<Option<Commit>> {
        let git = self.git.with_dir(workspace);
        git.add_all().await?;
        if !git.commit(message).await? {
            debug!(workspace = %workspace.display(), "Nothing to commit");
            return Ok(None);
        }
        Ok(Some(Commit {
            id: git.head().await?,
            message: message.to_string(),
        }))
    }

    async fn push(&self, workspace: &Path, branch: &str) -> Result<()> {
        self.git.with_dir(workspace).push(&self.remote, branch).await
    }
}
