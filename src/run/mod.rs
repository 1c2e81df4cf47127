mod phase;
mod review;
mod store;
mod types;

pub use phase::{Phase, PhaseTransition, RunStatus};
pub use review::{PatchAttempt, PatchOutcome, ReviewFinding, ReviewReport, Severity};
pub use store::{RunStore, write_atomic};
pub use types::{ChainInfo, ChangeRequest, Commit, PublishState, Run, RunFailure};
