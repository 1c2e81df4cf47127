use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use super::env::{Placeholders, render_dotenv, workspace_env};
use crate::allocator::Allocation;
use crate::config::{STATE_DIR, WorkspaceConfig};
use crate::error::{PilotError, Result};
use crate::git::VersionControl;
use crate::verification::run_shell;

const ENV_FILE: &str = "env";
const TOOLS_FILE: &str = "tools.json";
const SETUP_MARKER: &str = "setup.done";

/// Creates, configures and tears down per-run git worktrees.
pub struct WorkspaceManager {
    vcs: Arc<dyn VersionControl>,
    workspaces_dir: PathBuf,
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VersionControl>, workspaces_dir: &Path, config: WorkspaceConfig) -> Self {
        Self {
            vcs,
            workspaces_dir: workspaces_dir.to_path_buf(),
            config,
        }
    }

    pub fn workspaces_dir(&self) -> &Path {
        &self.workspaces_dir
    }

    /// Create the worktree for `branch_name` at the allocated path. An existing
    /// worktree at that path is reused.
    pub async fn create(&self, allocation: &Allocation, branch_name: &str, base: &str) -> Result<PathBuf> {
        let path = &allocation.workspace_path;

        if is_worktree(path) {
            debug!(path = %path.display(), "Worktree already exists");
            return Ok(path.clone());
        }

        if path.exists() {
            warn!(path = %path.display(), "Removing partial workspace before re-creating it");
            fs::remove_dir_all(path).await?;
        }

        fs::create_dir_all(&self.workspaces_dir).await?;
        self.vcs.worktree_add(path, branch_name, base).await?;

        info!(branch = %branch_name, path = %path.display(), "Created worktree");
        Ok(path.clone())
    }

    /// Install per-workspace configuration and run the one-time setup commands.
    /// Returns the environment applied to processes inside the workspace.
    pub async fn configure(
        &self,
        run_id: &str,
        allocation: &Allocation,
    ) -> Result<BTreeMap<String, String>> {
        let workspace = &allocation.workspace_path;
        let state_dir = workspace.join(STATE_DIR);
        fs::create_dir_all(&state_dir).await?;

        fs::write(state_dir.join(".gitignore"), "*\n").await?;

        let env = self.env_for(run_id, allocation);
        fs::write(state_dir.join(ENV_FILE), render_dotenv(&env)).await?;

        let placeholders = Placeholders { run_id, allocation };
        let tools = placeholders.expand_all(&self.config.tools);
        fs::write(
            state_dir.join(TOOLS_FILE),
            serde_json::to_vec_pretty(&tools)?,
        )
        .await?;

        let marker = state_dir.join(SETUP_MARKER);
        if marker.exists() {
            debug!(run_id, "Setup already completed");
            return Ok(env);
        }

        let timeout = Duration::from_secs(self.config.setup_timeout_secs);
        for (i, cmd) in self.config.setup_commands.iter().enumerate() {
            let name = format!("setup[{}]", i);
            let result = run_shell(&name, cmd, workspace, &env, timeout).await;
            if !result.passed {
                return Err(PilotError::workspace(result.summary(), workspace));
            }
        }
        fs::write(&marker, chrono::Utc::now().to_rfc3339()).await?;

        info!(
            run_id,
            ports = %allocation.ports,
            setup_commands = self.config.setup_commands.len(),
            "Configured workspace"
        );
        Ok(env)
    }

    pub fn env_for(&self, run_id: &str, allocation: &Allocation) -> BTreeMap<String, String> {
        workspace_env(run_id, allocation, &self.config.env)
    }

    /// Remove the worktree. Safe on missing or half-created workspaces.
    pub async fn destroy(&self, path: &Path) -> Result<()> {
        if let Err(e) = self.vcs.worktree_remove(path).await {
            debug!(path = %path.display(), error = %e, "Git worktree remove failed, using force remove");
        }

        match fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PilotError::workspace(e.to_string(), path)),
        }

        info!(path = %path.display(), "Removed workspace");
        Ok(())
    }

    /// Remove workspace directories not owned by any live run.
    pub async fn cleanup_orphaned(&self, live: &[PathBuf]) -> Result<Vec<PathBuf>> {
        if !self.workspaces_dir.exists() {
            return Ok(Vec::new());
        }

        let mut dir = fs::read_dir(&self.workspaces_dir).await?;
        let mut orphaned = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() && !live.contains(&path) {
                orphaned.push(path);
            }
        }

        for path in &orphaned {
            warn!(path = %path.display(), "Cleaning up orphaned workspace");
            if let Err(e) = self.destroy(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove orphaned workspace");
            }
        }

        Ok(orphaned)
    }
}

fn is_worktree(path: &Path) -> bool {
    path.join(".git").exists()
}
