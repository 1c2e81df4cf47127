use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::ContextRecord;
use crate::allocator::Allocation;
use crate::config::STATE_DIR;
use crate::error::{PilotError, Result};
use crate::run::write_atomic;

pub const CONTEXT_FILE: &str = "context.json";

/// Reads and writes the per-run context record kept inside the workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextStore;

impl ContextStore {
    pub fn new() -> Self {
        Self
    }

    pub fn path_for(workspace: &Path) -> PathBuf {
        workspace.join(STATE_DIR).join(CONTEXT_FILE)
    }

    /// Create the record with its baseline fields, or return the existing one on
    /// resume.
    pub async fn init(&self, run_id: &str, allocation: &Allocation) -> Result<ContextRecord> {
        let path = Self::path_for(&allocation.workspace_path);
        if path.exists() {
            let mut existing = self.load(&allocation.workspace_path).await?;
            if existing.run_id().is_none() {
                existing.absorb_missing(ContextRecord::new(run_id, allocation));
                self.save(&allocation.workspace_path, &existing).await?;
            }
            return Ok(existing);
        }

        let record = ContextRecord::new(run_id, allocation);
        self.save(&allocation.workspace_path, &record).await?;
        Ok(record)
    }

    pub async fn load(&self, workspace: &Path) -> Result<ContextRecord> {
        let content = fs::read_to_string(Self::path_for(workspace)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the record durably. Keys an agent added to the file since it was
    /// last loaded are merged back in so the key set never shrinks.
    pub async fn save(&self, workspace: &Path, record: &ContextRecord) -> Result<()> {
        let path = Self::path_for(workspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut merged = record.clone();
        if path.exists() {
            let on_disk = self.load(workspace).await.map_err(|e| unreadable(&path, e))?;
            merged.absorb_missing(on_disk);
        }

        let content = serde_json::to_vec_pretty(&merged)?;
        write_atomic(&path, &content).await?;
        debug!(path = %path.display(), keys = merged.keys().count(), "Context record flushed");
        Ok(())
    }

    /// Load, apply `f`, save. Returns the merged record.
    ///
    /// A missing or unreadable record is an error: starting over from an empty
    /// record would drop every key written so far.
    pub async fn update<F>(&self, workspace: &Path, f: F) -> Result<ContextRecord>
    where
        F: FnOnce(&mut ContextRecord) -> Result<()>,
    {
        let path = Self::path_for(workspace);
        let mut record = self.load(workspace).await.map_err(|e| unreadable(&path, e))?;
        f(&mut record)?;
        self.save(workspace, &record).await?;
        self.load(workspace).await
    }
}

fn unreadable(path: &Path, err: PilotError) -> PilotError {
    warn!(path = %path.display(), error = %err, "Context record unreadable");
    PilotError::workspace(format!("context record unreadable: {}", err), path)
}
