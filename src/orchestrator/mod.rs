//! Run execution.
//!
//! - `Orchestrator`: drives a run through its phases and owns teardown
//! - `RunLocks`: per-run lock files with heartbeat
//! - `ArtifactPaths`: where each phase's output file lives in the workspace

mod artifacts;
mod engine;
mod lock;
mod phases;

pub use artifacts::{ArtifactPaths, display as display_path};
pub use engine::{CancelOutcome, Orchestrator, SubmitOptions};
pub use lock::{LockGuard, LockInfo, RunLocks};
