//! In-memory version control and code host.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use run_pilot::error::{PilotError, Result};
use run_pilot::git::{CodeHost, ReviewRequest, VersionControl};
use run_pilot::run::{ChangeRequest, Commit};

/// Worktrees are plain directories with a `.git` marker file; commits are counters.
#[derive(Debug, Default)]
pub struct MockVcs {
    commits: Mutex<Vec<Commit>>,
    removed: Mutex<Vec<PathBuf>>,
    pushes: AtomicUsize,
    push_attempts: AtomicUsize,
    push_failures: AtomicUsize,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail.
    pub fn failing_pushes(self, count: usize) -> Self {
        self.push_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.commits.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Pushes tried, failed ones included.
    pub fn push_attempts(&self) -> usize {
        self.push_attempts.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl VersionControl for MockVcs {
    async fn worktree_add(&self, path: &Path, _branch: &str, _base: &str) -> Result<()> {
        tokio::fs::create_dir_all(path.join("src")).await?;
        tokio::fs::write(path.join(".git"), "gitdir: mock\n").await?;
        Ok(())
    }

    async fn worktree_remove(&self, path: &Path) -> Result<()> {
        self.removed.lock().push(path.to_path_buf());
        Ok(())
    }

    async fn changed_files(&self, _workspace: &Path, _base: &str, _head: &str) -> Result<Vec<String>> {
        Ok(vec!["src/lib.rs".to_string()])
    }

    async fn commits(&self, _workspace: &Path, _base: &str, _head: &str) -> Result<Vec<Commit>> {
        Ok(self.commits.lock().clone())
    }

    async fn diff_stat(&self, _workspace: &Path, _base: &str, _head: &str) -> Result<String> {
        Ok(format!(" 1 file changed, {} commits", self.commits.lock().len()))
    }

    async fn commit(&self, _workspace: &Path, message: &str) -> Result<Option<Commit>> {
        let mut commits = self.commits.lock();
        let commit = Commit {
            id: format!("{:040x}", commits.len() + 1),
            message: message.to_string(),
        };
        commits.push(commit.clone());
        Ok(Some(commit))
    }

    async fn push(&self, _workspace: &Path, _branch: &str) -> Result<()> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.push_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.push_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PilotError::Other("connection reset by remote".into()));
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockHost {
    requests: Mutex<Vec<ReviewRequest>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn review_requests(&self) -> Vec<ReviewRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CodeHost for MockHost {
    async fn fetch_request(&self, issue_number: u64) -> Result<ChangeRequest> {
        let mut request = ChangeRequest::from_text(
            format!("Issue {}", issue_number),
            "Fetched from the code host",
        );
        request.issue_number = Some(issue_number);
        Ok(request)
    }

    async fn open_review_request(&self, request: &ReviewRequest) -> Result<String> {
        let mut requests = self.requests.lock();
        requests.push(request.clone());
        Ok(format!("https://example.test/pulls/{}", requests.len()))
    }
}
