//! Isolated per-run worktrees.

mod env;
mod manager;

pub use env::{Placeholders, render_dotenv, workspace_env};
pub use manager::WorkspaceManager;
