use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::allocator::Allocation;
use crate::error::Result;

/// Well-known field names. Agents read these from the context file instead of
/// re-deriving the same data with shell queries.
pub mod keys {
    pub const RUN_ID: &str = "run_id";
    pub const WORKSPACE_PATH: &str = "workspace_path";
    pub const PORTS: &str = "ports";
    pub const CREATED_AT: &str = "created_at";
    pub const BRANCH_NAME: &str = "branch_name";
    pub const BASE_BRANCH: &str = "base_branch";
    pub const CHANGE_REQUEST: &str = "change_request";
    pub const SPEC_FILE: &str = "spec_file";
    pub const CHANGED_FILES: &str = "changed_files";
    pub const COMMITS: &str = "commits";
    pub const DIFF_STAT: &str = "diff_stat";
    pub const FINDINGS_FILE: &str = "findings_file";
    pub const REVIEW_ITERATION: &str = "review_iteration";
    pub const PATCH_PLAN_FILE: &str = "patch_plan_file";
    pub const PATCH_ITERATION: &str = "patch_iteration";
    pub const TARGET_FILES: &str = "target_files";
    pub const DOC_FILE: &str = "doc_file";
    pub const REVIEW_URL: &str = "review_url";
}

/// Flat JSON object shared between phases. Keys are only ever added; values may
/// be overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextRecord {
    fields: Map<String, Value>,
}

impl ContextRecord {
    pub fn new(run_id: &str, allocation: &Allocation) -> Self {
        let mut record = Self::default();
        record.set(keys::RUN_ID, run_id);
        record.set(
            keys::WORKSPACE_PATH,
            allocation.workspace_path.display().to_string(),
        );
        record.set(
            keys::PORTS,
            serde_json::json!({
                "primary": allocation.ports.primary,
                "secondary": allocation.ports.secondary,
            }),
        );
        record.set(keys::CREATED_AT, Utc::now().to_rfc3339());
        record
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn set_serialized<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.fields
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.get_str(keys::RUN_ID)
    }

    /// Carry over keys present in `older` but missing here. Values already set on
    /// `self` win.
    pub fn absorb_missing(&mut self, older: ContextRecord) {
        for (key, value) in older.fields {
            self.fields.entry(key).or_insert(value);
        }
    }
}
