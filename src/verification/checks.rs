use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub output: Option<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn success(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            output: None,
            duration_ms: 0,
        }
    }

    pub fn failure(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            output: Some(output.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn summary(&self) -> String {
        match &self.output {
            Some(output) if !self.passed => format!("{} failed: {}", self.name, output),
            _ if self.passed => format!("{} passed", self.name),
            _ => format!("{} failed", self.name),
        }
    }
}
