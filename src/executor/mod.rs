//! Single-phase agent execution with timeout, retry and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentInvocation, AgentOutput};
use crate::config::AgentConfig;
use crate::error::ExecutionError;

#[derive(Debug)]
pub enum Outcome {
    Success(AgentOutput),
    /// Transient failures persisted through every allowed attempt.
    RetryableFailure {
        attempts: u32,
        error: ExecutionError,
    },
    FatalFailure(ExecutionError),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// `backoff_base * 2^attempt`, capped at `backoff_max`. `attempt` is zero-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

pub struct PhaseExecutor {
    agent: Arc<dyn Agent>,
    policy: RetryPolicy,
}

impl PhaseExecutor {
    pub fn new(agent: Arc<dyn Agent>, policy: RetryPolicy) -> Self {
        Self { agent, policy }
    }

    /// Run the agent for one phase. Transient failures are retried with
    /// exponential backoff; fatal failures return immediately. Cancelling the
    /// token drops the in-flight attempt, which kills the agent process.
    pub async fn invoke(&self, invocation: &AgentInvocation, cancel: &CancellationToken) -> Outcome {
        let max_attempts = self.policy.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            debug!(
                run_id = %invocation.run_id,
                phase = %invocation.phase,
                attempt,
                max_attempts,
                "Invoking agent"
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(run_id = %invocation.run_id, phase = %invocation.phase, "Agent invocation cancelled");
                    return Outcome::Cancelled;
                }
                result = tokio::time::timeout(self.policy.timeout, self.agent.run(invocation)) => result,
            };

            let error = match result {
                Ok(Ok(output)) => {
                    info!(run_id = %invocation.run_id, phase = %invocation.phase, attempt, "Agent succeeded");
                    return Outcome::Success(output);
                }
                Ok(Err(e)) => e,
                Err(_) => ExecutionError::Timeout {
                    operation: format!("{} agent", invocation.phase.as_str()),
                    duration_secs: self.policy.timeout.as_secs(),
                },
            };

            if error.is_permanent() {
                warn!(run_id = %invocation.run_id, phase = %invocation.phase, error = %error, "Agent failed permanently");
                return Outcome::FatalFailure(error);
            }

            if attempt >= max_attempts {
                warn!(
                    run_id = %invocation.run_id,
                    phase = %invocation.phase,
                    attempts = attempt,
                    error = %error,
                    "Agent retries exhausted"
                );
                return Outcome::RetryableFailure {
                    attempts: attempt,
                    error,
                };
            }

            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.policy.backoff(attempt - 1));
            warn!(
                run_id = %invocation.run_id,
                phase = %invocation.phase,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient agent failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
