use std::collections::BTreeMap;

use crate::allocator::Allocation;

/// Values substituted into configured env entries and tool endpoints.
pub struct Placeholders<'a> {
    pub run_id: &'a str,
    pub allocation: &'a Allocation,
}

impl Placeholders<'_> {
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{run_id}", self.run_id)
            .replace("{primary_port}", &self.allocation.ports.primary.to_string())
            .replace(
                "{secondary_port}",
                &self.allocation.ports.secondary.to_string(),
            )
            .replace(
                "{workspace}",
                &self.allocation.workspace_path.display().to_string(),
            )
    }

    pub fn expand_all(&self, templates: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        templates
            .iter()
            .map(|(k, v)| (k.clone(), self.expand(v)))
            .collect()
    }
}

/// Environment every process in the workspace sees. Configured entries cannot
/// override the built-in `PILOT_*` keys.
pub fn workspace_env(
    run_id: &str,
    allocation: &Allocation,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let placeholders = Placeholders { run_id, allocation };
    let mut env = placeholders.expand_all(extra);

    env.insert(
        "PORT".to_string(),
        allocation.ports.primary.to_string(),
    );
    env.insert("PILOT_RUN_ID".to_string(), run_id.to_string());
    env.insert(
        "PILOT_WORKSPACE".to_string(),
        allocation.workspace_path.display().to_string(),
    );
    env.insert(
        "PILOT_PRIMARY_PORT".to_string(),
        allocation.ports.primary.to_string(),
    );
    env.insert(
        "PILOT_SECONDARY_PORT".to_string(),
        allocation.ports.secondary.to_string(),
    );
    env
}

pub fn render_dotenv(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        if value.chars().any(|c| c.is_whitespace() || c == '#' || c == '"') {
            out.push_str(&format!("{}=\"{}\"\n", key, value.replace('"', "\\\"")));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}
