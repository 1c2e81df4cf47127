use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::Run;
use crate::error::{PilotError, Result};

/// Durable run records, one YAML document per run.
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: &Path) -> Self {
        Self {
            runs_dir: runs_dir.to_path_buf(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.runs_dir).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    pub async fn save(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.id);
        let content = serde_yaml_bw::to_string(run)?;
        write_atomic(&path, content.as_bytes()).await
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.runs_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    pub async fn load(&self, run_id: &str) -> Result<Run> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(PilotError::RunNotFound(run_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let run: Run = serde_yaml_bw::from_str(&content)?;
        Ok(run)
    }

    pub async fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.run_path(run_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        self.clear_cancel(run_id).await;
        Ok(())
    }

    pub async fn exists(&self, run_id: &str) -> bool {
        self.run_path(run_id).exists()
    }

    /// All readable runs, newest first. Unparseable records are skipped.
    pub async fn list(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();

        if !self.runs_dir.exists() {
            return Ok(runs);
        }

        let mut entries = fs::read_dir(&self.runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                match fs::read_to_string(&path).await {
                    Ok(content) => match serde_yaml_bw::from_str::<Run>(&content) {
                        Ok(run) => runs.push(run),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable run record")
                        }
                    },
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to read run record"),
                }
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Runs that have not reached a terminal phase, oldest first.
    pub async fn list_resumable(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .list()
            .await?
            .into_iter()
            .filter(Run::is_resumable)
            .collect();
        runs.reverse();
        Ok(runs)
    }

    /// Leave a marker the driving process polls for. Used when cancelling from
    /// another process.
    pub async fn request_cancel(&self, run_id: &str) -> Result<()> {
        if !self.exists(run_id).await {
            return Err(PilotError::RunNotFound(run_id.to_string()));
        }
        fs::write(self.cancel_path(run_id), chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }

    pub fn cancel_requested(&self, run_id: &str) -> bool {
        self.cancel_path(run_id).exists()
    }

    pub async fn clear_cancel(&self, run_id: &str) {
        let _ = fs::remove_file(self.cancel_path(run_id)).await;
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.yaml", run_id))
    }

    fn cancel_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.cancel", run_id))
    }
}

/// Write via a synced temp file and rename so readers never see a partial document.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, content).await?;

    let sync_path = tmp_path.clone();
    match tokio::task::spawn_blocking(move || {
        std::fs::File::open(&sync_path).and_then(|file| file.sync_all())
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to sync temp file to disk"),
        Err(e) => warn!(error = %e, "Failed to sync temp file to disk"),
    }

    fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), "Atomic write completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::run::{ChangeRequest, Phase};

    fn run(id: &str) -> Run {
        Run::new(id, ChangeRequest::from_issue(1), "main", "pilot")
    }

    async fn store() -> (TempDir, RunStore) {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(&dir.path().join("runs"));
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_dir, store) = store().await;
        let mut r = run("r-1");
        r.advance(Phase::Build, "planned").unwrap();
        store.save(&r).await.unwrap();

        let loaded = store.load("r-1").await.unwrap();
        assert_eq!(loaded.phase, Phase::Build);
        assert_eq!(loaded.history.len(), 1);
        assert!(!store.runs_dir().join("r-1.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let (_dir, store) = store().await;
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, PilotError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_init_removes_interrupted_writes() {
        let dir = TempDir::new().unwrap();
        let runs_dir = dir.path().join("runs");
        std::fs::create_dir_all(&runs_dir).unwrap();
        std::fs::write(runs_dir.join("r-1.yaml.tmp"), "partial").unwrap();

        let store = RunStore::new(&runs_dir);
        store.init().await.unwrap();
        assert!(!runs_dir.join("r-1.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn test_list_resumable_skips_terminal_runs() {
        let (_dir, store) = store().await;
        let active = run("r-active");
        let mut done = run("r-done");
        done.advance(Phase::Cleanup, "finished").unwrap();
        done.advance(Phase::Completed, "cleaned").unwrap();

        store.save(&active).await.unwrap();
        store.save(&done).await.unwrap();
        std::fs::write(store.runs_dir().join("garbage.yaml"), ": : :").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        let resumable = store.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, "r-active");
    }

    #[tokio::test]
    async fn test_cancel_marker_lifecycle() {
        let (_dir, store) = store().await;
        assert!(store.request_cancel("r-1").await.is_err());

        store.save(&run("r-1")).await.unwrap();
        store.request_cancel("r-1").await.unwrap();
        assert!(store.cancel_requested("r-1"));

        store.clear_cancel("r-1").await;
        assert!(!store.cancel_requested("r-1"));
    }
}
