use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{PilotError, Result};

pub const STATE_DIR: &str = ".pilot";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub orchestrator: OrchestratorConfig,
    pub allocator: AllocatorConfig,
    pub workspace: WorkspaceConfig,
    pub agent: AgentConfig,
    pub review: ReviewConfig,
    pub verification: VerificationConfig,
    pub git: GitConfig,
    pub publish: PublishConfig,
    pub notification: NotificationConfig,
}

impl PilotConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join(CONFIG_FILE);
        let content =
            toml::to_string_pretty(self).map_err(|e| PilotError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.orchestrator.max_concurrent_runs == 0 {
            errors.push("orchestrator.max_concurrent_runs must be greater than 0");
        }
        if self.orchestrator.cancel_poll_ms == 0 {
            errors.push("orchestrator.cancel_poll_ms must be greater than 0");
        }
        if self.orchestrator.heartbeat_interval_secs == 0 {
            errors.push("orchestrator.heartbeat_interval_secs must be greater than 0");
        }
        if self.orchestrator.heartbeat_interval_secs >= self.orchestrator.lock_stale_threshold_secs
        {
            errors.push("orchestrator.heartbeat_interval_secs must be below lock_stale_threshold_secs");
        }

        if self.allocator.slot_count == 0 {
            errors.push("allocator.slot_count must be greater than 0");
        }
        if self.allocator.max_probes == 0 {
            errors.push("allocator.max_probes must be greater than 0");
        }
        if self.allocator.port_base < 1024 {
            errors.push("allocator.port_base must not use privileged ports (< 1024)");
        }
        let last_port = u32::from(self.allocator.port_base) + 2 * u32::from(self.allocator.slot_count);
        if last_port > u32::from(u16::MAX) {
            errors.push("allocator.port_base + 2 * slot_count must fit in the port range");
        }

        if self.agent.command.trim().is_empty() {
            errors.push("agent.command must not be empty");
        }
        if self.agent.timeout_secs == 0 {
            errors.push("agent.timeout_secs must be greater than 0");
        }
        if self.agent.backoff_base_ms > self.agent.backoff_max_ms {
            errors.push("agent.backoff_base_ms must not exceed backoff_max_ms");
        }

        if self.workspace.setup_timeout_secs == 0 {
            errors.push("workspace.setup_timeout_secs must be greater than 0");
        }
        if self.verification.command_timeout_secs == 0 {
            errors.push("verification.command_timeout_secs must be greater than 0");
        }
        if self.publish.max_attempts == 0 {
            errors.push("publish.max_attempts must be greater than 0");
        }

        if self.git.base_branch.trim().is_empty() {
            errors.push("git.base_branch must not be empty");
        }
        if self.git.branch_prefix.trim().is_empty() {
            errors.push("git.branch_prefix must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PilotError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on runs driven at once by `resume --all`.
    pub max_concurrent_runs: usize,
    pub lock_stale_threshold_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// How often a driving process checks for an out-of-process cancel request.
    pub cancel_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            lock_stale_threshold_secs: 120,
            heartbeat_interval_secs: 30,
            cancel_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub port_base: u16,
    /// Number of port pairs; the usable range is `port_base .. port_base + 2 * slot_count`.
    pub slot_count: u16,
    pub max_probes: u32,
    /// Workspaces root, relative to the repository root unless absolute.
    pub workspaces_dir: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            port_base: 20000,
            slot_count: 500,
            max_probes: 64,
            workspaces_dir: String::from(".worktrees"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Destroy the workspace on every terminal transition.
    Always,
    /// Keep failed and cancelled workspaces for inspection.
    #[default]
    OnSuccess,
    Never,
}

impl RetentionPolicy {
    pub fn should_destroy(&self, succeeded: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnSuccess => succeeded,
            Self::Never => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub retention: RetentionPolicy,
    /// One-time shell commands run inside a fresh workspace (dependency install, db init).
    pub setup_commands: Vec<String>,
    pub setup_timeout_secs: u64,
    /// Extra environment entries. Values may use `{run_id}`, `{primary_port}`,
    /// `{secondary_port}` and `{workspace}` placeholders.
    pub env: BTreeMap<String, String>,
    /// Tool endpoints written to `.pilot/tools.json`, with the same placeholders.
    pub tools: BTreeMap<String, String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            setup_commands: Vec::new(),
            setup_timeout_secs: 600,
            env: BTreeMap::new(),
            tools: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    /// Arguments placed before the rendered directive.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: String::from("claude"),
            args: vec![String::from("-p")],
            timeout_secs: 1800,
            max_retries: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub max_patch_iterations: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_patch_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Shell command for the Test phase. When unset the agent runs verification.
    pub test_cmd: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            test_cmd: None,
            command_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    pub commit_prefix: String,
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: String::from("main"),
            branch_prefix: String::from("pilot"),
            commit_prefix: String::from("pilot"),
            remote: String::from("origin"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub open_review_request: bool,
    pub reviewers: Vec<String>,
    /// Attempts for push / review-request transport calls.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            open_review_request: true,
            reviewers: Vec::new(),
            max_attempts: 3,
            retry_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub event_log: bool,
    pub hook_command: Option<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_log: true,
            hook_command: None,
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub workspaces_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf, config: &PilotConfig) -> Self {
        let state_dir = root.join(STATE_DIR);
        let workspaces_dir = {
            let configured = Path::new(&config.allocator.workspaces_dir);
            if configured.is_absolute() {
                configured.to_path_buf()
            } else {
                root.join(configured)
            }
        };

        Self {
            runs_dir: state_dir.join("runs"),
            logs_dir: state_dir.join("logs"),
            locks_dir: state_dir.join("locks"),
            workspaces_dir,
            state_dir,
            root,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.state_dir,
            &self.runs_dir,
            &self.logs_dir,
            &self.locks_dir,
            &self.workspaces_dir,
        ];

        for dir in dirs {
            fs::create_dir_all(dir).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PilotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_port_range_overflow_rejected() {
        let mut config = PilotConfig::default();
        config.allocator.port_base = 65000;
        config.allocator.slot_count = 1000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port range"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = PilotConfig::default();
        config.agent.timeout_secs = 0;
        config.allocator.max_probes = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("agent.timeout_secs"));
        assert!(err.contains("allocator.max_probes"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PilotConfig = toml::from_str(
            r#"
            [review]
            max_patch_iterations = 5

            [workspace]
            retention = "always"
            "#,
        )
        .unwrap();
        assert_eq!(config.review.max_patch_iterations, 5);
        assert_eq!(config.workspace.retention, RetentionPolicy::Always);
        assert_eq!(config.allocator.port_base, 20000);
    }

    #[test]
    fn test_retention_policy() {
        assert!(RetentionPolicy::Always.should_destroy(false));
        assert!(RetentionPolicy::OnSuccess.should_destroy(true));
        assert!(!RetentionPolicy::OnSuccess.should_destroy(false));
        assert!(!RetentionPolicy::Never.should_destroy(true));
    }

    #[test]
    fn test_relative_workspaces_dir_joins_root() {
        let config = PilotConfig::default();
        let paths = ProjectPaths::new(PathBuf::from("/repo"), &config);
        assert_eq!(paths.workspaces_dir, PathBuf::from("/repo/.worktrees"));
        assert_eq!(paths.runs_dir, PathBuf::from("/repo/.pilot/runs"));
    }
}
