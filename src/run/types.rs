use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PatchAttempt, Phase, PhaseTransition, ReviewFinding, RunStatus};
use crate::allocator::{Allocation, Ports};
use crate::error::{FailureKind, PilotError, Result};
use crate::utils::slugify;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl ChangeRequest {
    pub fn from_issue(issue_number: u64) -> Self {
        Self {
            issue_number: Some(issue_number),
            ..Default::default()
        }
    }

    pub fn from_text(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            issue_number: None,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.issue_number.is_none()
            && self.title.trim().is_empty()
            && self.description.trim().is_empty()
        {
            return Err(PilotError::InvalidChangeRequest(
                "an issue number, title or description is required".into(),
            ));
        }
        Ok(())
    }

    /// Title used for slugs and review requests; falls back to the issue or description.
    pub fn display_title(&self) -> String {
        if !self.title.trim().is_empty() {
            return self.title.trim().to_string();
        }
        if let Some(first_line) = self.description.lines().find(|l| !l.trim().is_empty()) {
            return first_line.trim().to_string();
        }
        match self.issue_number {
            Some(n) => format!("issue {}", n),
            None => String::from("change"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub message: String,
}

/// Metadata for externally chained multi-run workflows; passed through untouched
/// to the completion notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<u64>,
}

impl ChainInfo {
    pub fn is_chained(&self) -> bool {
        self.queue_id.is_some() || self.parent_reference.is_some()
    }
}

/// Guards for the non-idempotent actions of the Publish phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishState {
    #[serde(default)]
    pub pushed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<ReviewFinding>,
}

impl RunFailure {
    pub fn from_error(error: &PilotError, phase: Phase) -> Self {
        let findings = match error {
            PilotError::ReviewBlocked { findings, .. } => findings.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: error.failure_kind(),
            phase,
            message: error.to_string(),
            findings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub change_request: ChangeRequest,
    pub branch_name: String,
    pub base_branch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    allocation: Option<Allocation>,

    pub phase: Phase,
    pub status: RunStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_patch_iterations: u32,

    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub patches: Vec<PatchAttempt>,

    #[serde(default)]
    pub published: PublishState,
    #[serde(default)]
    pub chain: ChainInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Completion notification delivered; a resumed cleanup does not resend it.
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub cleaned_up: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub history: Vec<PhaseTransition>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        change_request: ChangeRequest,
        base_branch: impl Into<String>,
        branch_prefix: &str,
    ) -> Self {
        let id = id.into();
        let branch_name = format!(
            "{}/{}-{}",
            branch_prefix,
            id,
            slugify(&change_request.display_title())
        );

        Self {
            id,
            change_request,
            branch_name,
            base_branch: base_branch.into(),
            allocation: None,
            phase: Phase::Plan,
            status: RunStatus::Pending,
            retry_count: 0,
            max_patch_iterations: 3,
            artifacts: BTreeMap::new(),
            commits: Vec::new(),
            patches: Vec::new(),
            published: PublishState::default(),
            chain: ChainInfo::default(),
            failure: None,
            notified: false,
            cleaned_up: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            history: Vec::new(),
        }
    }

    pub fn generate_id() -> String {
        format!("r-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    pub fn with_max_patch_iterations(mut self, max: u32) -> Self {
        self.max_patch_iterations = max;
        self
    }

    pub fn with_chain(mut self, chain: ChainInfo) -> Self {
        self.chain = chain;
        self
    }

    pub fn slug(&self) -> String {
        slugify(&self.change_request.display_title())
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.allocation.as_ref().map(|a| a.workspace_path.as_path())
    }

    pub fn ports(&self) -> Option<Ports> {
        self.allocation.as_ref().map(|a| a.ports)
    }

    /// Bind the run to its allocation. The binding is write-once: re-assigning the
    /// same allocation is accepted (resume), a different one is rejected.
    pub fn assign_allocation(&mut self, allocation: Allocation) -> Result<()> {
        match &self.allocation {
            Some(existing) if *existing == allocation => Ok(()),
            Some(_) => Err(PilotError::AllocationImmutable {
                run_id: self.id.clone(),
            }),
            None => {
                self.allocation = Some(allocation);
                Ok(())
            }
        }
    }

    /// Move to `to`, recording the transition. Rejects moves the phase graph forbids.
    pub fn advance(&mut self, to: Phase, reason: impl Into<String>) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(PilotError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.history
            .push(PhaseTransition::new(self.phase, to, reason.into()));
        self.phase = to;
        Ok(())
    }

    /// Set the terminal status. Only the first call has any effect.
    pub fn mark_terminal(&mut self, status: RunStatus, failure: Option<RunFailure>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.failure = failure;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Runs whose teardown has not finished yet; these are picked up on restart.
    pub fn is_resumable(&self) -> bool {
        !self.phase.is_terminal()
    }

    pub fn record_artifact(&mut self, phase: Phase, path: impl Into<PathBuf>) {
        let path = path.into();
        let entry = self.artifacts.entry(phase.as_str().to_string()).or_default();
        if !entry.contains(&path) {
            entry.push(path);
        }
    }

    pub fn record_commit(&mut self, commit: Commit) {
        if !self.commits.iter().any(|c| c.id == commit.id) {
            self.commits.push(commit);
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Count of transitions into `phase`, used to check trace shapes.
    pub fn visits(&self, phase: Phase) -> usize {
        self.history.iter().filter(|t| t.to == phase).count()
    }
}
