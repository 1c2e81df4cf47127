use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    Recommended,
    Optional,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocker => write!(f, "blocker"),
            Self::Recommended => write!(f, "recommended"),
            Self::Optional => write!(f, "optional"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub resolved: bool,
}

impl ReviewFinding {
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            target_files: Vec::new(),
            resolved: false,
        }
    }

    pub fn with_target(mut self, file: impl Into<String>) -> Self {
        self.target_files.push(file.into());
        self
    }

    pub fn is_blocker(&self) -> bool {
        self.severity == Severity::Blocker && !self.resolved
    }

    fn same_issue(&self, other: &ReviewFinding) -> bool {
        self.severity == other.severity
            && self.description == other.description
            && self.target_files == other.target_files
    }
}

/// Findings document the agent writes to the pre-computed findings path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewReport {
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
}

impl ReviewReport {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn blockers(&self) -> Vec<&ReviewFinding> {
        self.findings.iter().filter(|f| f.is_blocker()).collect()
    }

    pub fn has_blockers(&self) -> bool {
        self.findings.iter().any(ReviewFinding::is_blocker)
    }

    /// Files named by blocker findings, deduplicated and sorted; scopes the next patch.
    pub fn blocker_targets(&self) -> Vec<String> {
        self.blockers()
            .into_iter()
            .flat_map(|f| f.target_files.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Mark findings of `previous` that this review no longer reports as resolved.
    /// Returns how many were resolved.
    pub fn resolve_previous(&self, previous: &mut ReviewReport) -> usize {
        let mut resolved = 0;
        for finding in previous.findings.iter_mut().filter(|f| !f.resolved) {
            if !self.findings.iter().any(|f| f.same_issue(finding)) {
                finding.resolved = true;
                resolved += 1;
            }
        }
        resolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchAttempt {
    pub iteration: u32,
    pub plan_path: PathBuf,
    pub outcome: PatchOutcome,
}
