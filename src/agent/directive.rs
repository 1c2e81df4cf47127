use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::run::Phase;

/// Instruction handed to the agent: an operation plus positional arguments.
/// The first argument is always the run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub operation: String,
    pub args: Vec<String>,
}

impl Directive {
    pub fn new(operation: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: vec![run_id.into()],
        }
    }

    pub fn for_phase(phase: Phase, run_id: &str) -> Self {
        Self::new(phase.as_str(), run_id)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Slash-command form passed on the agent command line.
    pub fn render(&self) -> String {
        let mut out = format!("/{}", self.operation);
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                out.push('"');
                out.push_str(&arg.replace('"', "\\\""));
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Everything needed to run the agent once for a phase.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub run_id: String,
    pub phase: Phase,
    pub directive: Directive,
    pub workspace: PathBuf,
    pub context_path: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub stdout: String,
}
