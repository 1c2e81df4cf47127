//! Scripted agent for driving runs without a real coding agent.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use run_pilot::agent::{Agent, AgentInvocation, AgentOutput};
use run_pilot::error::ExecutionError;
use run_pilot::run::{ReviewFinding, ReviewReport};

/// What the agent does for one invocation of an operation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the artifact the operation is expected to produce, if any.
    Succeed,
    /// Write these findings to the findings path.
    Findings(Vec<ReviewFinding>),
    /// Succeed without writing anything.
    Noop,
    Fail(ExecutionError),
    /// Never finish on its own; only cancellation ends it.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub operation: String,
    pub args: Vec<String>,
    pub workspace: PathBuf,
    /// Context keys visible to the agent at the time of the call.
    pub context_keys: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct MockAgent {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for `operation`; once exhausted the operation succeeds.
    pub fn script(self, operation: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .entry(operation.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.operation.clone()).collect()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Poll until `operation` has been invoked `times` times.
    pub async fn wait_for(&self, operation: &str, times: usize) {
        for _ in 0..500 {
            if self.call_count(operation) >= times {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent never reached {} x{}", operation, times);
    }

    fn next_step(&self, operation: &str) -> Step {
        self.scripts
            .lock()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

async fn write_file(path: &Path, content: &str) -> Result<AgentOutput, ExecutionError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecutionError::Other(e.to_string()))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ExecutionError::Other(e.to_string()))?;
    Ok(AgentOutput::default())
}

fn context_keys(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&s).ok())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

#[async_trait]
impl Agent for MockAgent {
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput, ExecutionError> {
        let operation = invocation.directive.operation.clone();
        self.calls.lock().push(Call {
            operation: operation.clone(),
            args: invocation.directive.args.clone(),
            workspace: invocation.workspace.clone(),
            context_keys: context_keys(&invocation.context_path),
            env: invocation.env.clone(),
        });

        let target = invocation
            .directive
            .args
            .get(1)
            .map(|rel| invocation.workspace.join(rel));

        match self.next_step(&operation) {
            Step::Succeed => match (operation.as_str(), target) {
                ("plan", Some(path)) => write_file(&path, "# Spec\n").await,
                ("review", Some(path)) => write_file(&path, r#"{"findings": []}"#).await,
                ("patch", Some(path)) => write_file(&path, "# Patch plan\n").await,
                ("document", Some(path)) => write_file(&path, "# Docs\n").await,
                _ => Ok(AgentOutput::default()),
            },
            Step::Findings(findings) => {
                let Some(path) = target else {
                    return Err(ExecutionError::Other("no findings path".into()));
                };
                let report = ReviewReport { findings };
                let json = serde_json::to_string_pretty(&report)
                    .map_err(|e| ExecutionError::Other(e.to_string()))?;
                write_file(&path, &json).await
            }
            Step::Noop => Ok(AgentOutput::default()),
            Step::Fail(error) => Err(error),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AgentOutput::default())
            }
        }
    }
}
