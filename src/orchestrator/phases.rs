//! Per-phase work. Each handler leaves the run ready for the next transition;
//! the driving loop in `engine` owns the transitions themselves.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifacts::{ArtifactPaths, display};
use super::engine::Orchestrator;
use crate::agent::{AgentInvocation, AgentOutput, Directive};
use crate::context::{ContextStore, keys};
use crate::error::{PilotError, Result};
use crate::executor::Outcome;
use crate::git::ReviewRequest;
use crate::notification::{EventType, RunEvent};
use crate::run::{PatchAttempt, PatchOutcome, Phase, ReviewReport, Run, write_atomic};

impl Orchestrator {
    pub(super) async fn plan(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        let (workspace, paths) = self.layout(run)?;
        let spec = paths.spec();
        let spec_abs = paths.absolute(&spec);

        let spec_display = display(&spec);
        self.contexts
            .update(&workspace, |ctx| {
                ctx.set(keys::SPEC_FILE, spec_display.as_str());
                Ok(())
            })
            .await?;

        if spec_abs.exists() {
            info!(run_id = %run.id, spec = %spec_display, "Spec already present, skipping planning agent");
        } else {
            let directive = Directive::for_phase(Phase::Plan, &run.id).arg(spec_display.as_str());
            self.invoke_agent(run, Phase::Plan, directive, token).await?;
            if !spec_abs.exists() {
                return Err(PilotError::FatalAgentFailure {
                    phase: Phase::Plan,
                    message: format!("agent finished without writing {}", spec_display),
                });
            }
        }

        run.record_artifact(Phase::Plan, spec_abs);
        Ok(())
    }

    pub(super) async fn build(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        let (workspace, paths) = self.layout(run)?;
        let directive = Directive::for_phase(Phase::Build, &run.id).arg(display(&paths.spec()));
        self.invoke_agent(run, Phase::Build, directive, token).await?;
        self.commit(run, &workspace, "build").await
    }

    /// Runs the configured test command, or asks the agent to test when none is set.
    pub(super) async fn test(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        let allocation = self.allocation_of(run)?;

        if self.verifier.has_test_command() {
            let env = self.workspaces.env_for(&run.id, &allocation);
            let result = tokio::select! {
                _ = token.cancelled() => return Err(PilotError::Cancelled),
                result = self.verifier.run_tests(&allocation.workspace_path, &env) => result,
            };
            return match result {
                Some(check) if !check.passed => Err(PilotError::TestFailed(check.summary())),
                _ => Ok(()),
            };
        }

        let directive = Directive::for_phase(Phase::Test, &run.id);
        match self.invoke_agent(run, Phase::Test, directive, token).await {
            Ok(_) => Ok(()),
            Err(PilotError::FatalAgentFailure { message, .. }) => Err(PilotError::TestFailed(message)),
            Err(e) => Err(e),
        }
    }

    /// Returns the phase to move to: Document when the review is clean, Patch
    /// while budget remains. An exhausted budget fails the run.
    pub(super) async fn review(&self, run: &mut Run, token: &CancellationToken) -> Result<Phase> {
        let (workspace, paths) = self.layout(run)?;
        let iteration = run.retry_count + 1;

        let changed = self
            .vcs
            .changed_files(&workspace, &run.base_branch, "HEAD")
            .await?;
        let commits = self.vcs.commits(&workspace, &run.base_branch, "HEAD").await?;
        let diff_stat = self
            .vcs
            .diff_stat(&workspace, &run.base_branch, "HEAD")
            .await?;
        for commit in &commits {
            run.record_commit(commit.clone());
        }

        let findings = paths.findings(iteration);
        let findings_display = display(&findings);
        self.contexts
            .update(&workspace, |ctx| {
                ctx.set_serialized(keys::CHANGED_FILES, &changed)?;
                ctx.set_serialized(keys::COMMITS, &commits)?;
                ctx.set(keys::DIFF_STAT, diff_stat);
                ctx.set(keys::FINDINGS_FILE, findings_display.as_str());
                ctx.set(keys::REVIEW_ITERATION, iteration);
                Ok(())
            })
            .await?;

        let findings_abs = paths.absolute(&findings);
        if !findings_abs.exists() {
            let directive =
                Directive::for_phase(Phase::Review, &run.id).arg(findings_display.as_str());
            self.invoke_agent(run, Phase::Review, directive, token).await?;
            if !findings_abs.exists() {
                return Err(PilotError::FatalAgentFailure {
                    phase: Phase::Review,
                    message: format!("agent finished without writing {}", findings_display),
                });
            }
        }

        let report = ReviewReport::load(&findings_abs).await.map_err(|e| {
            PilotError::FatalAgentFailure {
                phase: Phase::Review,
                message: format!("unreadable findings {}: {}", findings_display, e),
            }
        })?;
        run.record_artifact(Phase::Review, findings_abs);

        if iteration > 1 {
            self.mark_resolved(&paths, iteration - 1, &report).await;
        }

        let blockers = report.blockers();
        info!(
            run_id = %run.id,
            iteration,
            findings = report.findings.len(),
            blockers = blockers.len(),
            "Review finished"
        );

        if blockers.is_empty() {
            return Ok(Phase::Document);
        }

        if run.retry_count < run.max_patch_iterations {
            self.notifier
                .notify(
                    &RunEvent::new(EventType::PatchScheduled, &run.id)
                        .with_phase(Phase::Review)
                        .with_message(format!(
                            "{} blocker(s), patch {} of {}",
                            blockers.len(),
                            iteration,
                            run.max_patch_iterations
                        )),
                )
                .await;
            return Ok(Phase::Patch);
        }

        Err(PilotError::ReviewBlocked {
            retry_count: run.retry_count,
            findings: blockers.into_iter().cloned().collect(),
        })
    }

    /// Flag findings from the previous review that the latest one no longer reports.
    async fn mark_resolved(&self, paths: &ArtifactPaths, previous: u32, current: &ReviewReport) {
        let path = paths.absolute(&paths.findings(previous));
        let mut report = match ReviewReport::load(&path).await {
            Ok(report) => report,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Previous findings unavailable");
                return;
            }
        };

        let resolved = current.resolve_previous(&mut report);
        if resolved == 0 {
            return;
        }

        let written = match serde_json::to_vec_pretty(&report) {
            Ok(content) => write_atomic(&path, &content).await,
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => info!(resolved, iteration = previous, "Marked findings resolved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to update previous findings"),
        }
    }

    /// One patch iteration scoped to the files the blocking findings name.
    /// The incremented `retry_count` is persisted with the transition back to Review.
    pub(super) async fn patch(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        let (workspace, paths) = self.layout(run)?;
        let iteration = run.retry_count + 1;

        let findings = paths.findings(iteration);
        let report = ReviewReport::load(&paths.absolute(&findings)).await?;
        let targets = report.blocker_targets();

        let plan = paths.patch_plan(iteration);
        let plan_abs = paths.absolute(&plan);
        let plan_display = display(&plan);
        self.contexts
            .update(&workspace, |ctx| {
                ctx.set(keys::PATCH_PLAN_FILE, plan_display.as_str());
                ctx.set(keys::PATCH_ITERATION, iteration);
                ctx.set_serialized(keys::TARGET_FILES, &targets)
            })
            .await?;

        let directive = Directive::for_phase(Phase::Patch, &run.id)
            .arg(plan_display.as_str())
            .arg(display(&findings));

        if let Err(e) = self.invoke_agent(run, Phase::Patch, directive, token).await {
            if !matches!(e, PilotError::Cancelled) {
                run.patches.push(PatchAttempt {
                    iteration,
                    plan_path: plan_abs,
                    outcome: PatchOutcome::Failed,
                });
            }
            return Err(e);
        }

        self.commit(run, &workspace, &format!("patch {}", iteration))
            .await?;
        if plan_abs.exists() {
            run.record_artifact(Phase::Patch, plan_abs.clone());
        }
        run.patches.push(PatchAttempt {
            iteration,
            plan_path: plan_abs,
            outcome: PatchOutcome::Applied,
        });
        run.retry_count += 1;
        Ok(())
    }

    pub(super) async fn document(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        let (workspace, paths) = self.layout(run)?;
        let doc = paths.doc();
        let doc_abs = paths.absolute(&doc);
        let doc_display = display(&doc);

        self.contexts
            .update(&workspace, |ctx| {
                ctx.set(keys::DOC_FILE, doc_display.as_str());
                Ok(())
            })
            .await?;

        if doc_abs.exists() {
            info!(run_id = %run.id, "Documentation already present, skipping agent");
        } else {
            let directive = Directive::for_phase(Phase::Document, &run.id).arg(doc_display.as_str());
            self.invoke_agent(run, Phase::Document, directive, token).await?;
        }

        if doc_abs.exists() {
            run.record_artifact(Phase::Document, doc_abs);
        }
        self.commit(run, &workspace, "document").await
    }

    /// Push the branch and open the review request. Each step is skipped once
    /// recorded, so a resumed run never publishes twice.
    pub(super) async fn publish(&self, run: &mut Run, token: &CancellationToken) -> Result<()> {
        if !self.config.publish.enabled {
            info!(run_id = %run.id, "Publishing disabled");
            return Ok(());
        }
        let workspace = self.allocation_of(run)?.workspace_path;

        if !run.published.pushed {
            let branch = run.branch_name.clone();
            self.with_transport_retry("push", token, || self.vcs.push(&workspace, &branch))
                .await?;
            run.published.pushed = true;
            self.persist(run).await?;
        }

        if self.config.publish.open_review_request && run.published.review_url.is_none() {
            let request = ReviewRequest {
                workspace: workspace.clone(),
                branch: run.branch_name.clone(),
                base: run.base_branch.clone(),
                title: format!("[{}] {}", run.id, run.change_request.display_title()),
                body: review_body(run),
            };
            let url = self
                .with_transport_retry("review request", token, || {
                    self.host.open_review_request(&request)
                })
                .await?;
            info!(run_id = %run.id, url = %url, "Review request opened");

            run.published.review_url = Some(url.clone());
            self.persist(run).await?;
            self.contexts
                .update(&workspace, |ctx| {
                    ctx.set(keys::REVIEW_URL, url);
                    Ok(())
                })
                .await?;
        }

        Ok(())
    }

    async fn with_transport_retry<T, F, Fut>(
        &self,
        operation: &str,
        token: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.publish.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = Duration::from_millis(
                        self.config.publish.retry_delay_ms * u64::from(attempt),
                    );
                    warn!(operation, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Transport call failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(PilotError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_agent(
        &self,
        run: &Run,
        phase: Phase,
        directive: Directive,
        token: &CancellationToken,
    ) -> Result<AgentOutput> {
        let allocation = self.allocation_of(run)?;
        let invocation = AgentInvocation {
            run_id: run.id.clone(),
            phase,
            directive,
            context_path: ContextStore::path_for(&allocation.workspace_path),
            env: self
                .workspaces
                .env_for(&run.id, &allocation)
                .into_iter()
                .collect(),
            workspace: allocation.workspace_path,
        };

        debug!(run_id = %run.id, phase = %phase, directive = %invocation.directive, "Invoking agent");
        match self.executor.invoke(&invocation, token).await {
            Outcome::Success(output) => Ok(output),
            Outcome::RetryableFailure { attempts, error } => {
                Err(PilotError::RetryableAgentFailure {
                    phase,
                    attempts,
                    message: error.to_string(),
                })
            }
            Outcome::FatalFailure(error) => Err(PilotError::FatalAgentFailure {
                phase,
                message: error.to_string(),
            }),
            Outcome::Cancelled => Err(PilotError::Cancelled),
        }
    }

    async fn commit(&self, run: &mut Run, workspace: &Path, what: &str) -> Result<()> {
        let message = format!("{}({}): {}", self.config.git.commit_prefix, run.id, what);
        match self.vcs.commit(workspace, &message).await? {
            Some(commit) => {
                debug!(run_id = %run.id, commit = %commit.id, "Committed");
                run.record_commit(commit);
            }
            None => debug!(run_id = %run.id, what, "Nothing to commit"),
        }
        Ok(())
    }

    fn layout(&self, run: &Run) -> Result<(PathBuf, ArtifactPaths)> {
        let workspace = self.allocation_of(run)?.workspace_path;
        let paths = ArtifactPaths::new(&workspace, &run.id, &run.slug());
        Ok((workspace, paths))
    }
}

fn review_body(run: &Run) -> String {
    let mut body = String::new();
    if let Some(number) = run.change_request.issue_number {
        body.push_str(&format!("Closes #{}\n\n", number));
    }
    if !run.change_request.description.trim().is_empty() {
        body.push_str(run.change_request.description.trim());
        body.push_str("\n\n");
    }

    body.push_str(&format!(
        "Run `{}` finished review after {} patch iteration(s).\n",
        run.id, run.retry_count
    ));
    if !run.commits.is_empty() {
        body.push_str("\nCommits:\n");
        for commit in &run.commits {
            let short = commit.id.get(..7).unwrap_or(&commit.id);
            body.push_str(&format!("- {} {}\n", short, commit.message));
        }
    }
    body
}
