use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Agent, AgentInvocation, AgentOutput};
use crate::config::AgentConfig;
use crate::error::ExecutionError;

pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn build(&self, invocation: &AgentInvocation) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(invocation.directive.render())
            .current_dir(&invocation.workspace)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("PILOT_CONTEXT_FILE", &invocation.context_path)
            .env("PILOT_RUN_ID", &invocation.run_id)
            .env("PILOT_PHASE", invocation.phase.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput, ExecutionError> {
        debug!(
            run_id = %invocation.run_id,
            phase = %invocation.phase,
            directive = %invocation.directive,
            "Spawning agent"
        );

        let output = self
            .build(invocation)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExecutionError::ToolNotFound(self.command.clone()),
                _ => ExecutionError::Other(format!("failed to spawn agent: {}", e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutionError::from_process_failure(
                output.status.code(),
                &stderr,
            ));
        }

        Ok(AgentOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        })
    }
}
