//! Configuration types and loading.
//!
//! - `PilotConfig`: top-level configuration, loaded from `.pilot/config.toml`
//! - `ProjectPaths`: state, run, log, lock and workspace directories

mod settings;

pub use settings::{
    AgentConfig, AllocatorConfig, CONFIG_FILE, GitConfig, NotificationConfig, OrchestratorConfig,
    PilotConfig, ProjectPaths, PublishConfig, RetentionPolicy, ReviewConfig, STATE_DIR,
    VerificationConfig, WorkspaceConfig,
};
