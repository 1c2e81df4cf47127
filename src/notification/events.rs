use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{Phase, Run, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunStarted,
    RunResumed,
    PhaseStarted,
    PhaseCompleted,
    PatchScheduled,
    RunCompleted,
    RunFailed,
    RunCancelled,
    WorkspaceRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunStarted => "run.started",
            Self::RunResumed => "run.resumed",
            Self::PhaseStarted => "phase.started",
            Self::PhaseCompleted => "phase.completed",
            Self::PatchScheduled => "review.patch_scheduled",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::WorkspaceRemoved => "workspace.removed",
        }
    }

    pub fn for_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => Self::RunCompleted,
            RunStatus::Cancelled => Self::RunCancelled,
            _ => Self::RunFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: EventType,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunEvent {
    pub fn new(event_type: EventType, run_id: impl Into<String>) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            created_at: Utc::now(),
            phase: None,
            message: None,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Payload delivered once a run reaches its terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotification {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<u64>,
    pub trigger_next: bool,
    pub metadata: CompletionMetadata,
}

impl CompletionNotification {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            issue_number: run.change_request.issue_number,
            queue_id: run.chain.queue_id.clone(),
            phase_number: run.chain.phase_number,
            parent_reference: run.chain.parent_reference,
            trigger_next: run.status == RunStatus::Completed && run.chain.is_chained(),
            metadata: CompletionMetadata {
                duration_seconds: run.duration_seconds(),
                cost: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ChainInfo, ChangeRequest};

    fn run(status: RunStatus, chain: ChainInfo) -> Run {
        let mut run = Run::new("r-1", ChangeRequest::from_issue(42), "main", "pilot").with_chain(chain);
        run.started_at = Some(Utc::now());
        run.mark_terminal(status, None);
        run
    }

    #[test]
    fn test_trigger_next_requires_completion_and_chain() {
        let chained = ChainInfo {
            queue_id: Some("q-1".into()),
            phase_number: Some(2),
            parent_reference: None,
        };

        let n = CompletionNotification::from_run(&run(RunStatus::Completed, chained.clone()));
        assert!(n.trigger_next);
        assert_eq!(n.issue_number, Some(42));
        assert_eq!(n.phase_number, Some(2));

        let failed = CompletionNotification::from_run(&run(RunStatus::Failed, chained));
        assert!(!failed.trigger_next);

        let standalone =
            CompletionNotification::from_run(&run(RunStatus::Completed, ChainInfo::default()));
        assert!(!standalone.trigger_next);
    }

    #[test]
    fn test_payload_shape() {
        let n = CompletionNotification::from_run(&run(RunStatus::Completed, ChainInfo::default()));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["trigger_next"], false);
        assert!(value.get("queue_id").is_none());
        assert!(value["metadata"]["duration_seconds"].is_number());
    }
}
