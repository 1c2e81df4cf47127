#![allow(dead_code)]

pub mod mock_agent;
pub mod mock_vcs;
pub mod project;

use run_pilot::run::{ChangeRequest, ReviewFinding, Severity};

pub use mock_agent::{Call, MockAgent, Step};
pub use mock_vcs::{MockHost, MockVcs};
pub use project::TestProject;

pub fn request(title: &str) -> ChangeRequest {
    ChangeRequest::from_text(title, format!("{} for the tests", title))
}

pub fn blocker(description: &str, file: &str) -> ReviewFinding {
    ReviewFinding::new(Severity::Blocker, description).with_target(file)
}
