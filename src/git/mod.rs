//! Version control and code host access.
//!
//! - `VersionControl` / `GitVcs`: worktrees, commits, pushes and diff queries
//! - `CodeHost` / `GhHost`: issues and pull requests through the GitHub CLI

mod host;
mod runner;
mod vcs;

pub use host::{CodeHost, GhHost, ReviewRequest};
pub use runner::{GhRunner, GitRunner};
pub use vcs::{GitVcs, VersionControl};
