pub mod agent;
pub mod allocator;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod git;
pub mod notification;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod utils;
pub mod verification;
pub mod workspace;

pub use allocator::{Allocation, Ports, ResourceAllocator};
pub use context::{ContextRecord, ContextStore};
pub use error::{PilotError, Result};
pub use git::{CodeHost, GhRunner, GitRunner, VersionControl};
pub use orchestrator::{CancelOutcome, Orchestrator, SubmitOptions};
pub use registry::RunRegistry;
pub use run::{ChangeRequest, Phase, Run, RunStatus, RunStore};
pub use workspace::WorkspaceManager;
