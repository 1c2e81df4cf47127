use std::path::{Path, PathBuf};

use crate::config::STATE_DIR;

/// Deterministic locations of the files each phase produces, relative to the
/// workspace. Computed up front so agents never have to search for them.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    workspace: PathBuf,
    stem: String,
}

impl ArtifactPaths {
    pub fn new(workspace: &Path, run_id: &str, slug: &str) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            stem: format!("{}-{}", run_id, slug),
        }
    }

    pub fn spec(&self) -> PathBuf {
        Path::new(STATE_DIR)
            .join("specs")
            .join(format!("{}.md", self.stem))
    }

    pub fn findings(&self, iteration: u32) -> PathBuf {
        Path::new(STATE_DIR)
            .join("reviews")
            .join(format!("review-{}.json", iteration))
    }

    pub fn patch_plan(&self, iteration: u32) -> PathBuf {
        Path::new(STATE_DIR)
            .join("patches")
            .join(format!("patch-{}.md", iteration))
    }

    pub fn doc(&self) -> PathBuf {
        Path::new(STATE_DIR)
            .join("docs")
            .join(format!("{}.md", self.stem))
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.workspace.join(relative)
    }
}

pub fn display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
