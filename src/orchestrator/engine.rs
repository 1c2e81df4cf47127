use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lock::RunLocks;
use crate::agent::{Agent, CommandAgent};
use crate::allocator::{Allocation, ResourceAllocator};
use crate::config::{PilotConfig, ProjectPaths};
use crate::context::{ContextStore, keys};
use crate::error::{PilotError, Result};
use crate::executor::{PhaseExecutor, RetryPolicy};
use crate::git::{CodeHost, GhHost, GitVcs, VersionControl};
use crate::notification::{CompletionNotification, EventType, Notifier, RunEvent};
use crate::registry::RunRegistry;
use crate::run::{ChainInfo, ChangeRequest, Phase, Run, RunFailure, RunStatus, RunStore};
use crate::verification::Verifier;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Caller-chosen id; generated when absent.
    pub run_id: Option<String>,
    pub max_patch_iterations: Option<u32>,
    pub chain: ChainInfo,
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// The run is driven by this process and its token was cancelled.
    Signalled,
    /// Another process drives the run and will pick up the cancel marker.
    Requested,
    /// The run was idle and has been settled as cancelled.
    Cancelled(Box<Run>),
    AlreadyFinished(Box<Run>),
}

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Orchestrator {
    pub(super) config: PilotConfig,
    pub(super) paths: ProjectPaths,
    pub(super) store: RunStore,
    pub(super) registry: Arc<RunRegistry>,
    pub(super) allocator: ResourceAllocator,
    pub(super) workspaces: WorkspaceManager,
    pub(super) contexts: ContextStore,
    pub(super) executor: PhaseExecutor,
    pub(super) verifier: Verifier,
    pub(super) vcs: Arc<dyn VersionControl>,
    pub(super) host: Arc<dyn CodeHost>,
    pub(super) notifier: Notifier,
    locks: RunLocks,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    /// Orchestrator backed by the real agent command, `git` and `gh`.
    pub fn new(config: PilotConfig, paths: ProjectPaths) -> Result<Self> {
        config.validate()?;
        let agent: Arc<dyn Agent> = Arc::new(CommandAgent::new(&config.agent));
        let vcs: Arc<dyn VersionControl> =
            Arc::new(GitVcs::new(paths.root.clone(), config.git.remote.clone()));
        let host: Arc<dyn CodeHost> =
            Arc::new(GhHost::new(&paths.root, config.publish.reviewers.clone()));
        Ok(Self::with_collaborators(config, paths, agent, vcs, host))
    }

    pub fn with_collaborators(
        config: PilotConfig,
        paths: ProjectPaths,
        agent: Arc<dyn Agent>,
        vcs: Arc<dyn VersionControl>,
        host: Arc<dyn CodeHost>,
    ) -> Self {
        let registry = Arc::new(RunRegistry::new());
        let allocator =
            ResourceAllocator::new(Arc::clone(&registry), &paths.workspaces_dir, &config.allocator);
        let workspaces = WorkspaceManager::new(
            Arc::clone(&vcs),
            &paths.workspaces_dir,
            config.workspace.clone(),
        );
        let executor = PhaseExecutor::new(agent, RetryPolicy::from_config(&config.agent));
        let notifier = Notifier::new(config.notification.clone(), Some(paths.logs_dir.clone()));

        Self {
            store: RunStore::new(&paths.runs_dir),
            locks: RunLocks::new(&paths.locks_dir, &config.orchestrator),
            verifier: Verifier::new(config.verification.clone()),
            contexts: ContextStore::new(),
            cancels: Mutex::new(HashMap::new()),
            registry,
            allocator,
            workspaces,
            executor,
            notifier,
            vcs,
            host,
            config,
            paths,
        }
    }

    /// Prepare state directories and rebuild the registry from persisted runs.
    /// Returns the runs that still need driving.
    pub async fn init(&self) -> Result<Vec<Run>> {
        self.paths.ensure_dirs().await?;
        self.store.init().await?;
        let recovered = self.registry.recover(&self.store).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered unfinished runs");
        }
        Ok(recovered)
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Create and persist a run without driving it.
    pub async fn submit(&self, request: ChangeRequest, options: SubmitOptions) -> Result<Run> {
        let request = self.resolve_request(request).await?;
        request.validate()?;

        let run_id = options.run_id.unwrap_or_else(Run::generate_id);
        if self.registry.contains(&run_id) || self.store.exists(&run_id).await {
            return Err(PilotError::RunAlreadyExists(run_id));
        }

        let max_patch_iterations = options
            .max_patch_iterations
            .unwrap_or(self.config.review.max_patch_iterations);
        let run = Run::new(
            run_id,
            request,
            &self.config.git.base_branch,
            &self.config.git.branch_prefix,
        )
        .with_max_patch_iterations(max_patch_iterations)
        .with_chain(options.chain);

        self.store.save(&run).await?;
        self.registry.insert(run.clone())?;

        self.notifier
            .notify(
                &RunEvent::new(EventType::RunCreated, &run.id)
                    .with_message(run.change_request.display_title()),
            )
            .await;
        info!(run_id = %run.id, branch = %run.branch_name, "Run created");

        Ok(run)
    }

    /// Submit and drive a run to its terminal state.
    pub async fn start(&self, request: ChangeRequest, options: SubmitOptions) -> Result<Run> {
        let run = self.submit(request, options).await?;
        self.drive(&run.id).await
    }

    async fn resolve_request(&self, request: ChangeRequest) -> Result<ChangeRequest> {
        match request.issue_number {
            Some(number)
                if request.title.trim().is_empty() && request.description.trim().is_empty() =>
            {
                debug!(issue = number, "Fetching change request from code host");
                self.host.fetch_request(number).await
            }
            _ => Ok(request),
        }
    }

    /// Drive a run from its current phase to a terminal state, then clean up.
    ///
    /// Run-level failures are recorded on the returned run; `Err` is reserved
    /// for failures to load, lock or persist it.
    pub async fn drive(&self, run_id: &str) -> Result<Run> {
        let _lock = self.locks.acquire(run_id).await?;
        let mut run = self.store.load(run_id).await?;

        if !run.is_resumable() {
            debug!(run_id, phase = %run.phase, "Run already finished");
            return Ok(run);
        }

        let token = CancellationToken::new();
        self.cancels
            .lock()
            .insert(run_id.to_string(), token.clone());
        let _watcher = self.watch_cancel_marker(run_id, token.clone());
        if self.store.cancel_requested(run_id) {
            token.cancel();
        }

        let result = if run.phase == Phase::Cleanup {
            if run.status.is_terminal() {
                Ok(())
            } else {
                Err(PilotError::Other("run interrupted before its outcome was recorded".into()))
            }
        } else {
            self.execute(&mut run, &token).await
        };

        let finished = self.finish(&mut run, result).await;
        self.cancels.lock().remove(run_id);
        finished?;
        Ok(run)
    }

    fn watch_cancel_marker(&self, run_id: &str, token: CancellationToken) -> TaskGuard {
        let store = RunStore::new(self.store.runs_dir());
        let run_id = run_id.to_string();
        let interval = Duration::from_millis(self.config.orchestrator.cancel_poll_ms);

        TaskGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if store.cancel_requested(&run_id) {
                            info!(run_id = %run_id, "Cancel marker found");
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn execute(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(PilotError::Cancelled);
        }

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
            self.notifier
                .notify(&RunEvent::new(EventType::RunStarted, &run.id).with_phase(run.phase))
                .await;
        } else {
            info!(run_id = %run.id, phase = %run.phase, "Resuming run");
            self.notifier
                .notify(&RunEvent::new(EventType::RunResumed, &run.id).with_phase(run.phase))
                .await;
        }
        self.persist(run).await?;

        self.prepare(run).await?;

        loop {
            if token.is_cancelled() {
                return Err(PilotError::Cancelled);
            }

            let phase = run.phase;
            if phase.is_terminal() || phase == Phase::Cleanup {
                return Ok(());
            }

            info!(run_id = %run.id, phase = %phase, "Phase started");
            self.notifier
                .notify(&RunEvent::new(EventType::PhaseStarted, &run.id).with_phase(phase))
                .await;

            let next = match phase {
                Phase::Plan => {
                    self.plan(run, token).await?;
                    Phase::Build
                }
                Phase::Build => {
                    self.build(run, token).await?;
                    Phase::Test
                }
                Phase::Test => {
                    self.test(run, token).await?;
                    Phase::Review
                }
                Phase::Review => self.review(run, token).await?,
                Phase::Patch => {
                    self.patch(run, token).await?;
                    Phase::Review
                }
                Phase::Document => {
                    self.document(run, token).await?;
                    Phase::Publish
                }
                Phase::Publish => {
                    self.publish(run, token).await?;
                    return Ok(());
                }
                Phase::Cleanup | Phase::Completed | Phase::Failed | Phase::Cancelled => {
                    return Ok(());
                }
            };

            self.transition(run, next, &format!("{} finished", phase.as_str()))
                .await?;
        }
    }

    /// Allocate (or reclaim) resources and bring the workspace up.
    async fn prepare(&self, run: &mut Run) -> Result<()> {
        let allocation = match run.allocation() {
            Some(existing) => self.allocator.reclaim(&run.id, existing)?,
            None => self.allocator.allocate(&run.id)?,
        };
        run.assign_allocation(allocation.clone())?;
        self.persist(run).await?;

        self.workspaces
            .create(&allocation, &run.branch_name, &run.base_branch)
            .await?;
        self.workspaces.configure(&run.id, &allocation).await?;
        self.contexts.init(&run.id, &allocation).await?;

        let branch = run.branch_name.clone();
        let base = run.base_branch.clone();
        let request = run.change_request.clone();
        self.contexts
            .update(&allocation.workspace_path, move |ctx| {
                ctx.set(keys::BRANCH_NAME, branch);
                ctx.set(keys::BASE_BRANCH, base);
                ctx.set_serialized(keys::CHANGE_REQUEST, &request)
            })
            .await?;

        Ok(())
    }

    pub(super) async fn transition(&self, run: &mut Run, to: Phase, reason: &str) -> Result<()> {
        let from = run.phase;
        if let Err(e) = run.advance(to, reason) {
            error!(
                run_id = %run.id,
                from = %from,
                to = %to,
                allowed = ?from.allowed_transitions(),
                "Invalid phase transition attempted"
            );
            return Err(e);
        }

        debug!(run_id = %run.id, from = %from, to = %to, reason, "Phase transition");
        self.persist(run).await?;
        self.notifier
            .notify(
                &RunEvent::new(EventType::PhaseCompleted, &run.id)
                    .with_phase(from)
                    .with_message(format!("next: {}", to.as_str())),
            )
            .await;
        Ok(())
    }

    pub(super) async fn persist(&self, run: &Run) -> Result<()> {
        self.store.save(run).await?;
        self.registry.upsert(run);
        Ok(())
    }

    /// Record the outcome exactly once, move to Cleanup and tear down.
    async fn finish(&self, run: &mut Run, result: Result<()>) -> Result<()> {
        if !run.status.is_terminal() {
            let (status, failure) = match &result {
                Ok(()) => (RunStatus::Completed, None),
                Err(e @ PilotError::Cancelled) => {
                    (RunStatus::Cancelled, Some(RunFailure::from_error(e, run.phase)))
                }
                Err(e) => (RunStatus::Failed, Some(RunFailure::from_error(e, run.phase))),
            };

            match &failure {
                Some(f) if status == RunStatus::Failed => {
                    warn!(run_id = %run.id, phase = %f.phase, kind = %f.kind, error = %f.message, "Run failed");
                }
                _ => info!(run_id = %run.id, status = %status, "Run outcome decided"),
            }
            run.mark_terminal(status, failure);
        }

        if run.phase != Phase::Cleanup {
            run.advance(Phase::Cleanup, format!("run {}", run.status))?;
        }
        self.persist(run).await?;

        self.cleanup(run).await
    }

    /// Teardown. Safe to repeat after a crash; the guard flag makes the
    /// completed teardown a no-op.
    async fn cleanup(&self, run: &mut Run) -> Result<()> {
        if run.cleaned_up {
            return Ok(());
        }

        let succeeded = run.status == RunStatus::Completed;
        if let Some(path) = run.workspace_path().map(Path::to_path_buf) {
            if self.config.workspace.retention.should_destroy(succeeded) {
                match self.workspaces.destroy(&path).await {
                    Ok(()) => {
                        self.notifier
                            .notify(&RunEvent::new(EventType::WorkspaceRemoved, &run.id))
                            .await;
                    }
                    Err(e) => warn!(run_id = %run.id, error = %e, "Failed to remove workspace"),
                }
            } else {
                info!(run_id = %run.id, path = %path.display(), "Workspace retained");
            }
        }

        self.allocator.release(&run.id);
        self.registry.remove(&run.id);

        if !run.notified {
            let message = match &run.failure {
                Some(f) => format!("{} in {}: {}", f.kind, f.phase, f.message),
                None => run.status.to_string(),
            };
            self.notifier
                .notify(&RunEvent::new(EventType::for_status(run.status), &run.id).with_message(message))
                .await;
            self.notifier
                .notify_completion(&CompletionNotification::from_run(run))
                .await;
            run.notified = true;
            self.store.save(run).await?;
        }

        run.cleaned_up = true;
        let terminal = run.status.terminal_phase().unwrap_or(Phase::Failed);
        run.advance(terminal, "cleanup finished")?;
        self.store.save(run).await?;
        self.store.clear_cancel(&run.id).await;

        info!(
            run_id = %run.id,
            status = %run.status,
            retry_count = run.retry_count,
            duration_secs = run.duration_seconds().unwrap_or_default(),
            "Run finished"
        );
        Ok(())
    }

    /// Cancel a run wherever it is being driven.
    pub async fn cancel(&self, run_id: &str) -> Result<CancelOutcome> {
        let local = self.cancels.lock().get(run_id).cloned();
        if let Some(token) = local {
            token.cancel();
            info!(run_id, "Cancel signal sent");
            return Ok(CancelOutcome::Signalled);
        }

        let run = self.store.load(run_id).await?;
        if !run.is_resumable() {
            return Ok(CancelOutcome::AlreadyFinished(Box::new(run)));
        }

        self.store.request_cancel(run_id).await?;
        if self.locks.is_actively_running(run_id).await {
            info!(run_id, "Cancel requested from driving process");
            return Ok(CancelOutcome::Requested);
        }

        match self.drive(run_id).await {
            Ok(run) => Ok(CancelOutcome::Cancelled(Box::new(run))),
            Err(PilotError::RunLocked { .. }) => Ok(CancelOutcome::Requested),
            Err(e) => Err(e),
        }
    }

    /// Cancel every run driven by this process.
    pub fn interrupt_all(&self) {
        for (run_id, token) in self.cancels.lock().iter() {
            debug!(run_id = %run_id, "Interrupting run");
            token.cancel();
        }
    }

    pub async fn status(&self, run_id: &str) -> Result<Run> {
        match self.registry.get(run_id) {
            Some(run) => Ok(run),
            None => self.store.load(run_id).await,
        }
    }

    /// Runs in the store, optionally filtered by status. Live statuses are
    /// answered from the registry, which holds every unfinished run.
    pub async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        match status {
            Some(status) if !status.is_terminal() => Ok(self.registry.list_by_status(status)),
            Some(status) => Ok(self
                .store
                .list()
                .await?
                .into_iter()
                .filter(|r| r.status == status)
                .collect()),
            None => self.store.list().await,
        }
    }

    /// Drive several runs concurrently, bounded by `max_concurrent_runs`.
    pub async fn drive_many(self: &Arc<Self>, run_ids: Vec<String>) -> Vec<(String, Result<Run>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.orchestrator.max_concurrent_runs));
        let mut tasks = JoinSet::new();

        for run_id in run_ids {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = this.drive(&run_id).await;
                (run_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Run task aborted"),
            }
        }
        results
    }

    /// Resume every unfinished run not already driven by another process.
    pub async fn resume_all(self: &Arc<Self>) -> Result<Vec<(String, Result<Run>)>> {
        let mut ids = Vec::new();
        for run in self.store.list_resumable().await? {
            if self.locks.is_actively_running(&run.id).await {
                debug!(run_id = %run.id, "Run driven elsewhere, skipping");
                continue;
            }
            ids.push(run.id);
        }
        Ok(self.drive_many(ids).await)
    }

    /// Remove workspace directories that no unfinished run owns.
    pub async fn cleanup_orphaned(&self) -> Result<Vec<PathBuf>> {
        let mut live: Vec<PathBuf> = self
            .store
            .list_resumable()
            .await?
            .iter()
            .filter_map(|r| r.workspace_path().map(Path::to_path_buf))
            .collect();
        live.extend(
            self.registry
                .allocations()
                .into_iter()
                .map(|(_, a)| a.workspace_path),
        );
        self.workspaces.cleanup_orphaned(&live).await
    }

    pub(super) fn allocation_of(&self, run: &Run) -> Result<Allocation> {
        run.allocation()
            .cloned()
            .ok_or_else(|| PilotError::Other(format!("run {} has no allocation", run.id)))
    }
}
