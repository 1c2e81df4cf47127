mod fixtures;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use fixtures::{MockAgent, MockVcs, Step, TestProject, blocker, request};
use run_pilot::allocator::{Allocation, Ports};
use run_pilot::config::RetentionPolicy;
use run_pilot::context::{ContextStore, keys};
use run_pilot::orchestrator::SubmitOptions;
use tempfile::TempDir;

fn allocation(dir: &TempDir) -> Allocation {
    Allocation {
        ports: Ports {
            primary: 21000,
            secondary: 21001,
        },
        workspace_path: dir.path().to_path_buf(),
    }
}

#[tokio::test]
async fn test_context_keys_only_accumulate_across_phases() {
    let mut project = TestProject::new();
    project.config.workspace.retention = RetentionPolicy::Never;
    let agent = Arc::new(MockAgent::new().script(
        "review",
        vec![Step::Findings(vec![blocker("n+1 query", "src/db.rs")])],
    ));
    let orchestrator = project
        .orchestrator(agent.clone(), Arc::new(MockVcs::new()))
        .await;

    let run = orchestrator
        .start(request("Speed up listing"), SubmitOptions::default())
        .await
        .unwrap();

    let calls = agent.calls();
    assert!(!calls.is_empty());

    let mut previous: BTreeSet<String> = BTreeSet::new();
    for call in &calls {
        let current: BTreeSet<String> = call.context_keys.iter().cloned().collect();
        assert!(
            previous.is_subset(&current),
            "{} lost keys {:?}",
            call.operation,
            previous.difference(&current).collect::<Vec<_>>()
        );
        previous = current;
    }

    let plan = &calls[0];
    for key in [
        keys::RUN_ID,
        keys::WORKSPACE_PATH,
        keys::PORTS,
        keys::BRANCH_NAME,
        keys::CHANGE_REQUEST,
        keys::SPEC_FILE,
    ] {
        assert!(plan.context_keys.iter().any(|k| k == key), "plan missing {}", key);
    }

    let workspace = run.workspace_path().unwrap();
    let record = ContextStore::new().load(workspace).await.unwrap();
    assert_eq!(record.run_id(), Some(run.id.as_str()));
    assert_eq!(record.get_str(keys::BRANCH_NAME), Some(run.branch_name.as_str()));
    assert_eq!(record.get(keys::REVIEW_ITERATION).unwrap(), 2);
    assert_eq!(record.get(keys::PATCH_ITERATION).unwrap(), 1);
    let targets: Vec<String> = record.get_as(keys::TARGET_FILES).unwrap();
    assert_eq!(targets, vec!["src/db.rs"]);
    let changed: Vec<String> = record.get_as(keys::CHANGED_FILES).unwrap();
    assert_eq!(changed, vec!["src/lib.rs"]);
    assert_eq!(
        record.get_str(keys::REVIEW_URL),
        run.published.review_url.as_deref()
    );
}

#[tokio::test]
async fn test_agent_written_keys_survive_orchestrator_updates() {
    let dir = TempDir::new().unwrap();
    let store = ContextStore::new();
    store.init("r-1", &allocation(&dir)).await.unwrap();

    let path = ContextStore::path_for(dir.path());
    let mut raw: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    raw.insert("agent_notes".into(), "kept".into());
    std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

    let record = store
        .update(dir.path(), |ctx| {
            ctx.set(keys::SPEC_FILE, ".pilot/specs/r-1-x.md");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(record.get_str("agent_notes"), Some("kept"));
    assert_eq!(record.get_str(keys::SPEC_FILE), Some(".pilot/specs/r-1-x.md"));
}

#[tokio::test]
async fn test_init_preserves_existing_record() {
    let dir = TempDir::new().unwrap();
    let store = ContextStore::new();
    store.init("r-1", &allocation(&dir)).await.unwrap();
    store
        .update(dir.path(), |ctx| {
            ctx.set(keys::REVIEW_ITERATION, 3);
            Ok(())
        })
        .await
        .unwrap();

    let record = store.init("r-1", &allocation(&dir)).await.unwrap();
    assert_eq!(record.get(keys::REVIEW_ITERATION).unwrap(), 3);
    assert_eq!(
        record.get_str(keys::WORKSPACE_PATH).map(PathBuf::from),
        Some(dir.path().to_path_buf())
    );
}
