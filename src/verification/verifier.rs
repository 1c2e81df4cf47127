use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::CheckResult;
use crate::config::VerificationConfig;
use crate::utils::truncate_with_marker;

const MAX_OUTPUT_CHARS: usize = 4000;

/// Run `cmd` through the platform shell in `working_dir` with `env` applied,
/// bounded by `timeout`. The child is killed when the timeout fires.
pub async fn run_shell(
    name: &str,
    cmd: &str,
    working_dir: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> CheckResult {
    let start = Instant::now();
    debug!(check = %name, cmd = %cmd, dir = %working_dir.display(), "Running shell command");

    let mut command = build_shell_command(cmd, working_dir);
    command.envs(env).kill_on_drop(true);

    let result = tokio::time::timeout(timeout, command.output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            debug!(check = %name, duration_ms, "Command passed");
            CheckResult::success(name).with_duration(duration_ms)
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            warn!(check = %name, code = ?output.status.code(), "Command failed");
            let combined = format!("{}\n{}", stdout, stderr);
            CheckResult::failure(name, truncate_with_marker(combined.trim(), MAX_OUTPUT_CHARS))
                .with_duration(duration_ms)
        }
        Ok(Err(e)) => {
            warn!(check = %name, error = %e, "Execution error");
            CheckResult::failure(name, e.to_string()).with_duration(duration_ms)
        }
        Err(_) => {
            warn!(check = %name, timeout_secs = timeout.as_secs(), "Timed out");
            CheckResult::failure(
                name,
                format!("{} timed out after {}s", name, timeout.as_secs()),
            )
            .with_duration(duration_ms)
        }
    }
}

#[cfg(windows)]
fn build_shell_command(cmd: &str, working_dir: &Path) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", cmd]).current_dir(working_dir);
    command
}

#[cfg(not(windows))]
fn build_shell_command(cmd: &str, working_dir: &Path) -> Command {
    let mut command = Command::new("sh");
    command.args(["-c", cmd]).current_dir(working_dir);
    command
}

/// Runs the configured test command for the Test phase.
#[derive(Clone)]
pub struct Verifier {
    config: VerificationConfig,
}

impl Verifier {
    pub fn new(config: VerificationConfig) -> Self {
        Self { config }
    }

    pub fn has_test_command(&self) -> bool {
        self.config
            .test_cmd
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// `None` when no test command is configured.
    pub async fn run_tests(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Option<CheckResult> {
        let cmd = self.config.test_cmd.as_deref().filter(|c| !c.trim().is_empty())?;
        let timeout = Duration::from_secs(self.config.command_timeout_secs);

        let result = run_shell("test", cmd, working_dir, env, timeout).await;
        info!(passed = result.passed, duration_ms = result.duration_ms, "Test command finished");
        Some(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_run_shell_passes_env() {
        let dir = TempDir::new().unwrap();
        let mut env = BTreeMap::new();
        env.insert("PILOT_RUN_ID".to_string(), "r-1".to_string());

        let result = run_shell(
            "env",
            "test \"$PILOT_RUN_ID\" = r-1",
            dir.path(),
            &env,
            Duration::from_secs(10),
        )
        .await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_run_shell_reports_failure_output() {
        let dir = TempDir::new().unwrap();
        let result = run_shell(
            "fail",
            "echo broken >&2; exit 3",
            dir.path(),
            &BTreeMap::new(),
            Duration::from_secs(10),
        )
        .await;
        assert!(!result.passed);
        assert!(result.output.unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn test_run_shell_times_out() {
        let dir = TempDir::new().unwrap();
        let result = run_shell(
            "slow",
            "sleep 5",
            dir.path(),
            &BTreeMap::new(),
            Duration::from_millis(100),
        )
        .await;
        assert!(!result.passed);
        assert!(result.output.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_verifier_without_command() {
        let dir = TempDir::new().unwrap();
        let verifier = Verifier::new(VerificationConfig::default());
        assert!(!verifier.has_test_command());
        assert!(verifier.run_tests(dir.path(), &BTreeMap::new()).await.is_none());
    }
}
