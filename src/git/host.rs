use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use super::GhRunner;
use crate::error::Result;
use crate::run::ChangeRequest;

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub workspace: PathBuf,
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// The service hosting issues and review requests.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn fetch_request(&self, issue_number: u64) -> Result<ChangeRequest>;

    /// Open a review request and return its URL.
    async fn open_review_request(&self, request: &ReviewRequest) -> Result<String>;
}

pub struct GhHost {
    gh: GhRunner,
    reviewers: Vec<String>,
}

impl GhHost {
    pub fn new(repo_root: &Path, reviewers: Vec<String>) -> Self {
        Self {
            gh: GhRunner::new(repo_root),
            reviewers,
        }
    }
}

#[derive(Deserialize)]
struct IssueView {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
}

#[async_trait]
impl CodeHost for GhHost {
    async fn fetch_request(&self, issue_number: u64) -> Result<ChangeRequest> {
        let json = self.gh.issue_view(issue_number).await?;
        let issue: IssueView = serde_json::from_str(&json)?;
        Ok(ChangeRequest {
            issue_number: Some(issue_number),
            title: issue.title,
            description: issue.body,
        })
    }

    async fn open_review_request(&self, request: &ReviewRequest) -> Result<String> {
        self.gh
            .create_pr(
                &request.workspace,
                &request.branch,
                &request.base,
                &request.title,
                &request.body,
                &self.reviewers,
            )
            .await
    }
}
