//! Shell command checks: workspace setup steps and the Test phase command.

mod checks;
mod verifier;

pub use checks::CheckResult;
pub use verifier::{Verifier, run_shell};
