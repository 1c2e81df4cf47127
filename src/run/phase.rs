use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Plan,
    Build,
    Test,
    Review,
    Patch,
    Document,
    Publish,
    /// Teardown. Entered from any phase once the run's outcome is decided.
    Cleanup,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn allowed_transitions(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Plan => &[Build, Cleanup, Failed, Cancelled],
            Build => &[Test, Cleanup, Failed, Cancelled],
            Test => &[Review, Cleanup, Failed, Cancelled],
            Review => &[Patch, Document, Cleanup, Failed, Cancelled],
            Patch => &[Review, Cleanup, Failed, Cancelled],
            Document => &[Publish, Cleanup, Failed, Cancelled],
            Publish => &[Cleanup, Failed, Cancelled],
            Cleanup => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: Phase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Operation name used in directives and artifact bookkeeping.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Patch => "patch",
            Self::Document => "document",
            Self::Publish => "publish",
            Self::Cleanup => "cleanup",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "Plan",
            Self::Build => "Build",
            Self::Test => "Test",
            Self::Review => "Review",
            Self::Patch => "Patch",
            Self::Document => "Document",
            Self::Publish => "Publish",
            Self::Cleanup => "Cleanup",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Phase a run settles in once Cleanup has finished.
    pub fn terminal_phase(&self) -> Option<Phase> {
        match self {
            RunStatus::Completed => Some(Phase::Completed),
            RunStatus::Failed => Some(Phase::Failed),
            RunStatus::Cancelled => Some(Phase::Cancelled),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl PhaseTransition {
    pub fn new(from: Phase, to: Phase, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_sequence_is_allowed() {
        let sequence = [
            Phase::Plan,
            Phase::Build,
            Phase::Test,
            Phase::Review,
            Phase::Document,
            Phase::Publish,
            Phase::Cleanup,
            Phase::Completed,
        ];
        for pair in sequence.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_review_patch_cycle() {
        assert!(Phase::Review.can_transition_to(Phase::Patch));
        assert!(Phase::Patch.can_transition_to(Phase::Review));
        assert!(!Phase::Patch.can_transition_to(Phase::Document));
    }

    #[test]
    fn test_cleanup_reachable_from_every_working_phase() {
        for phase in [
            Phase::Plan,
            Phase::Build,
            Phase::Test,
            Phase::Review,
            Phase::Patch,
            Phase::Document,
            Phase::Publish,
        ] {
            assert!(phase.can_transition_to(Phase::Cleanup));
            assert!(phase.can_transition_to(Phase::Failed));
            assert!(phase.can_transition_to(Phase::Cancelled));
        }
    }

    #[test]
    fn test_terminal_phases_are_final() {
        for phase in [Phase::Completed, Phase::Failed, Phase::Cancelled] {
            assert!(phase.is_terminal());
            assert!(phase.allowed_transitions().is_empty());
        }
        assert!(!Phase::Cleanup.is_terminal());
    }

    #[test]
    fn test_status_terminal_phase() {
        assert_eq!(RunStatus::Failed.terminal_phase(), Some(Phase::Failed));
        assert_eq!(RunStatus::Running.terminal_phase(), None);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }
}
