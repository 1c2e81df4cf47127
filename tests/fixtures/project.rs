//! Temporary repository layout with an orchestrator wired to mocks.

use std::path::Path;
use std::sync::Arc;

use run_pilot::config::{PilotConfig, ProjectPaths};
use run_pilot::orchestrator::Orchestrator;
use tempfile::TempDir;

use super::{MockAgent, MockHost, MockVcs};

pub struct TestProject {
    pub dir: TempDir,
    pub config: PilotConfig,
}

impl TestProject {
    /// Config tuned for tests: fast retries, fast cancel polling.
    pub fn new() -> Self {
        let mut config = PilotConfig::default();
        config.agent.max_retries = 1;
        config.agent.backoff_base_ms = 1;
        config.agent.backoff_max_ms = 5;
        config.agent.timeout_secs = 30;
        config.orchestrator.cancel_poll_ms = 20;
        config.publish.retry_delay_ms = 1;
        config.notification.timeout_secs = 5;

        Self {
            dir: TempDir::new().expect("temp dir"),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> ProjectPaths {
        ProjectPaths::new(self.root().to_path_buf(), &self.config)
    }

    pub async fn orchestrator(&self, agent: Arc<MockAgent>, vcs: Arc<MockVcs>) -> Arc<Orchestrator> {
        self.orchestrator_with_host(agent, vcs, Arc::new(MockHost::new()))
            .await
    }

    pub async fn orchestrator_with_host(
        &self,
        agent: Arc<MockAgent>,
        vcs: Arc<MockVcs>,
        host: Arc<MockHost>,
    ) -> Arc<Orchestrator> {
        let orchestrator =
            Orchestrator::with_collaborators(self.config.clone(), self.paths(), agent, vcs, host);
        orchestrator.init().await.expect("orchestrator init");
        Arc::new(orchestrator)
    }
}
