//! The external coding agent.
//!
//! The orchestrator only sees the `Agent` trait: a directive goes in, success or a
//! classified `ExecutionError` comes out. `CommandAgent` runs a CLI agent as a
//! child process.

mod command;
mod directive;

use async_trait::async_trait;

pub use command::CommandAgent;
pub use directive::{AgentInvocation, AgentOutput, Directive};

use crate::error::ExecutionError;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one attempt. Dropping the returned future must stop the agent.
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutput, ExecutionError>;
}
