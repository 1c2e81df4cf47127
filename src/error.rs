use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::{Phase, ReviewFinding};

/// Failure reported by a single agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    Timeout {
        operation: String,
        duration_secs: u64,
    },
    RateLimited {
        retry_after_secs: Option<u64>,
    },
    NetworkError(String),
    StreamError(String),
    ToolNotFound(String),
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    Other(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::NetworkError(_)
                | Self::StreamError(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Server-provided delay, if any. Overrides exponential backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Classify a failed process by its stderr.
    /// Only unambiguous markers (HTTP codes, explicit keywords) count as transient;
    /// anything else is a logic failure of the agent and is never retried.
    pub fn from_process_failure(exit_code: Option<i32>, stderr: &str) -> Self {
        match Self::from_message(stderr) {
            Self::Other(_) => Self::ProcessFailed {
                exit_code,
                stderr: crate::utils::truncate_with_marker(stderr.trim(), 2000),
            },
            classified => classified,
        }
    }

    pub fn from_message(msg: &str) -> Self {
        if msg.contains("429") || msg.contains("Too Many Requests") || msg.contains("rate limit")
        {
            return Self::RateLimited {
                retry_after_secs: Self::extract_retry_after(msg),
            };
        }
        if msg.contains("502") || msg.contains("503") || msg.contains("504") {
            return Self::NetworkError(msg.to_string());
        }
        if msg.contains("Connection reset") || msg.contains("connection refused") {
            return Self::NetworkError(msg.to_string());
        }
        if msg.contains("stream closed") || msg.contains("unexpected end of stream") {
            return Self::StreamError(msg.to_string());
        }
        if msg.contains("timed out after") || msg.contains("timeout after") {
            return Self::Timeout {
                operation: "agent".to_string(),
                duration_secs: 0,
            };
        }

        Self::Other(msg.to_string())
    }

    fn extract_retry_after(msg: &str) -> Option<u64> {
        // Search the lowercased copy only, so byte offsets stay aligned.
        let msg_lower = msg.to_lowercase();
        for pattern in ["retry after ", "retry-after: ", "retry_after="] {
            if let Some(idx) = msg_lower.find(pattern) {
                let after_pattern = &msg_lower[idx + pattern.len()..];
                let num_str: String = after_pattern
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if let Ok(secs) = num_str.parse() {
                    return Some(secs);
                }
            }
        }
        None
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                operation,
                duration_secs,
            } => write!(f, "Timeout after {}s: {}", duration_secs, operation),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "Rate limited, retry after {}s", secs)
                } else {
                    write!(f, "Rate limited")
                }
            }
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
            Self::StreamError(msg) => write!(f, "Stream error: {}", msg),
            Self::ToolNotFound(tool) => write!(f, "Agent command not found: {}", tool),
            Self::ProcessFailed { exit_code, stderr } => match exit_code {
                Some(code) => write!(f, "Agent exited with status {}: {}", code, stderr),
                None => write!(f, "Agent terminated by signal: {}", stderr),
            },
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunAlreadyExists(String),

    #[error("Invalid change request: {0}")]
    InvalidChangeRequest(String),

    #[error("No free port/workspace pair for run {run_id} after {probes} probes")]
    ResourceExhausted { run_id: String, probes: u32 },

    #[error("Workspace error: {message} ({})", .path.display())]
    Workspace { message: String, path: PathBuf },

    #[error("Agent failed transiently in {phase} after {attempts} attempt(s): {message}")]
    RetryableAgentFailure {
        phase: Phase,
        attempts: u32,
        message: String,
    },

    #[error("Agent failed in {phase}: {message}")]
    FatalAgentFailure { phase: Phase, message: String },

    #[error("Tests failed: {0}")]
    TestFailed(String),

    #[error(
        "Review blocked after {retry_count} patch iteration(s) with {} unresolved blocker finding(s)",
        .findings.len()
    )]
    ReviewBlocked {
        retry_count: u32,
        findings: Vec<ReviewFinding>,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Run {run_id} is already being driven (PID: {pid})")]
    RunLocked { run_id: String, pid: u32 },

    #[error("Failed to acquire lock for run: {run_id}")]
    LockAcquisitionFailed { run_id: String },

    #[error("Allocation for run {run_id} cannot change once assigned")]
    AllocationImmutable { run_id: String },

    #[error("Code host error: {0}")]
    CodeHost(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not in a git repository")]
    NotInGitRepo,

    #[error("Project not initialized. Run 'run-pilot init' first.")]
    NotInitialized,

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl PilotError {
    pub fn workspace(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Workspace {
            message: message.into(),
            path: path.into(),
        }
    }

    /// Coarse classification persisted on failed runs so operators can tell
    /// logic failures apart from infrastructure failures.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ResourceExhausted { .. } => FailureKind::ResourceExhausted,
            Self::Workspace { .. } => FailureKind::Workspace,
            Self::RetryableAgentFailure { .. } => FailureKind::RetryableAgentFailure,
            Self::FatalAgentFailure { .. } => FailureKind::FatalAgentFailure,
            Self::TestFailed(_) => FailureKind::TestFailed,
            Self::ReviewBlocked { .. } => FailureKind::ReviewBlocked,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Git(_) | Self::CodeHost(_) => FailureKind::Transport,
            _ => FailureKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ResourceExhausted,
    Workspace,
    RetryableAgentFailure,
    FatalAgentFailure,
    TestFailed,
    ReviewBlocked,
    Cancelled,
    Transport,
    Internal,
}

impl FailureKind {
    /// Logic failures mean the work itself was rejected; everything else means
    /// the system could not carry the run.
    pub fn is_logic_failure(&self) -> bool {
        matches!(
            self,
            Self::TestFailed | Self::ReviewBlocked | Self::FatalAgentFailure
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Workspace => "WorkspaceError",
            Self::RetryableAgentFailure => "RetryableAgentFailure",
            Self::FatalAgentFailure => "FatalAgentFailure",
            Self::TestFailed => "TestFailed",
            Self::ReviewBlocked => "ReviewBlocked",
            Self::Cancelled => "Cancelled",
            Self::Transport => "Transport",
            Self::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        let err = ExecutionError::from_message("HTTP 429 Too Many Requests, retry after 30");
        assert_eq!(
            err,
            ExecutionError::RateLimited {
                retry_after_secs: Some(30)
            }
        );
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_gateway_errors_are_transient() {
        assert!(ExecutionError::from_message("upstream returned 503").is_transient());
        assert!(ExecutionError::from_message("Connection reset by peer").is_transient());
    }

    #[test]
    fn test_unknown_process_failure_is_permanent() {
        let err = ExecutionError::from_process_failure(Some(1), "assertion failed: spec invalid");
        assert!(matches!(
            err,
            ExecutionError::ProcessFailed {
                exit_code: Some(1),
                ..
            }
        ));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_failure_kind_mapping() {
        let blocked = PilotError::ReviewBlocked {
            retry_count: 2,
            findings: vec![],
        };
        assert_eq!(blocked.failure_kind(), FailureKind::ReviewBlocked);
        assert!(blocked.failure_kind().is_logic_failure());

        let exhausted = PilotError::ResourceExhausted {
            run_id: "r-1".into(),
            probes: 64,
        };
        assert_eq!(exhausted.failure_kind(), FailureKind::ResourceExhausted);
        assert!(!exhausted.failure_kind().is_logic_failure());
    }
}
