mod fixtures;

use std::sync::Arc;

use fixtures::{MockAgent, MockVcs, Step, TestProject, request};
use run_pilot::error::FailureKind;
use run_pilot::orchestrator::{CancelOutcome, SubmitOptions};
use run_pilot::run::{ChainInfo, Phase, RunStatus};

#[tokio::test]
async fn test_cancel_signals_in_process_run() {
    let project = TestProject::new();
    let agent = Arc::new(MockAgent::new().script("build", vec![Step::Hang]));
    let orchestrator = project
        .orchestrator(agent.clone(), Arc::new(MockVcs::new()))
        .await;

    let run = orchestrator
        .submit(request("Add login"), SubmitOptions::default())
        .await
        .unwrap();
    let handle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let run_id = run.id.clone();
        async move { orchestrator.drive(&run_id).await }
    });
    agent.wait_for("build", 1).await;

    let outcome = orchestrator.cancel(&run.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Signalled));

    let cancelled = handle.await.unwrap().unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.phase, Phase::Cancelled);
    assert!(cancelled.cleaned_up);
    assert_eq!(
        cancelled.failure.as_ref().unwrap().kind,
        FailureKind::Cancelled
    );
    assert!(orchestrator.registry().allocation(&run.id).is_none());
    // Cancelled workspaces are kept for inspection under the default retention.
    assert!(cancelled.workspace_path().unwrap().exists());
    assert_eq!(agent.call_count("test"), 0);
}

#[tokio::test]
async fn test_cancel_from_another_process_uses_marker() {
    let project = TestProject::new();
    let agent = Arc::new(MockAgent::new().script("build", vec![Step::Hang]));
    let vcs = Arc::new(MockVcs::new());
    let driver = project.orchestrator(agent.clone(), vcs.clone()).await;

    let run = driver
        .submit(request("Add login"), SubmitOptions::default())
        .await
        .unwrap();
    let handle = tokio::spawn({
        let driver = Arc::clone(&driver);
        let run_id = run.id.clone();
        async move { driver.drive(&run_id).await }
    });
    agent.wait_for("build", 1).await;

    let other = project
        .orchestrator(Arc::new(MockAgent::new()), vcs)
        .await;
    let outcome = other.cancel(&run.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Requested));

    let cancelled = handle.await.unwrap().unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(!driver.store().cancel_requested(&run.id));
}

#[tokio::test]
async fn test_cancel_idle_run_settles_it() {
    let project = TestProject::new();
    let agent = Arc::new(MockAgent::new());
    let orchestrator = project
        .orchestrator(agent.clone(), Arc::new(MockVcs::new()))
        .await;

    let run = orchestrator
        .submit(request("Add login"), SubmitOptions::default())
        .await
        .unwrap();

    let outcome = orchestrator.cancel(&run.id).await.unwrap();
    let CancelOutcome::Cancelled(cancelled) = outcome else {
        panic!("expected the idle run to be settled");
    };
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.phase, Phase::Cancelled);
    assert!(cancelled.allocation().is_none());
    assert!(agent.operations().is_empty());

    let again = orchestrator.cancel(&run.id).await.unwrap();
    assert!(matches!(again, CancelOutcome::AlreadyFinished(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_completion_hook_receives_payload() {
    let mut project = TestProject::new();
    let hook_log = project.root().join("hook.log");
    project.config.notification.hook_command = Some(format!(
        "printf '%s\\n' \"$PILOT_EVENT_JSON\" >> '{}'",
        hook_log.display()
    ));
    let orchestrator = project
        .orchestrator(Arc::new(MockAgent::new()), Arc::new(MockVcs::new()))
        .await;

    let options = SubmitOptions {
        chain: ChainInfo {
            queue_id: Some("q-7".into()),
            phase_number: Some(2),
            parent_reference: Some(41),
        },
        ..Default::default()
    };
    let run = orchestrator.start(request("Add login"), options).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let content = std::fs::read_to_string(&hook_log).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let payload: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(payload["run_id"], run.id.as_str());
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["queue_id"], "q-7");
    assert_eq!(payload["phase_number"], 2);
    assert_eq!(payload["parent_reference"], 41);
    assert_eq!(payload["trigger_next"], true);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_run_notifies_without_trigger() {
    let mut project = TestProject::new();
    let hook_log = project.root().join("hook.log");
    project.config.notification.hook_command = Some(format!(
        "printf '%s\\n' \"$PILOT_EVENT_JSON\" >> '{}'",
        hook_log.display()
    ));
    let agent = Arc::new(MockAgent::new().script("plan", vec![Step::Noop]));
    let orchestrator = project
        .orchestrator(agent, Arc::new(MockVcs::new()))
        .await;

    let options = SubmitOptions {
        chain: ChainInfo {
            queue_id: Some("q-7".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let run = orchestrator.start(request("Add login"), options).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let payload: serde_json::Value =
        serde_json::from_str(std::fs::read_to_string(&hook_log).unwrap().trim()).unwrap();
    assert_eq!(payload["status"], "failed");
    assert_eq!(payload["trigger_next"], false);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_hook_does_not_fail_run() {
    let mut project = TestProject::new();
    project.config.notification.hook_command = Some("exit 1".into());
    let orchestrator = project
        .orchestrator(Arc::new(MockAgent::new()), Arc::new(MockVcs::new()))
        .await;

    let run = orchestrator
        .start(request("Add login"), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.phase, Phase::Completed);
}

#[cfg(unix)]
#[tokio::test]
async fn test_resumed_cleanup_does_not_renotify() {
    let mut project = TestProject::new();
    let hook_log = project.root().join("hook.log");
    project.config.notification.hook_command = Some(format!(
        "printf '%s\\n' \"$PILOT_RUN_ID\" >> '{}'",
        hook_log.display()
    ));
    let orchestrator = project
        .orchestrator(Arc::new(MockAgent::new()), Arc::new(MockVcs::new()))
        .await;

    let run = orchestrator
        .start(request("Add login"), SubmitOptions::default())
        .await
        .unwrap();
    assert!(run.notified);

    // Crash after delivery, before the teardown was recorded.
    let mut interrupted = orchestrator.store().load(&run.id).await.unwrap();
    interrupted.phase = Phase::Cleanup;
    interrupted.cleaned_up = false;
    orchestrator.store().save(&interrupted).await.unwrap();

    let settled = orchestrator.drive(&run.id).await.unwrap();
    assert_eq!(settled.status, RunStatus::Completed);
    assert_eq!(settled.phase, Phase::Completed);
    assert!(settled.cleaned_up);

    let content = std::fs::read_to_string(&hook_log).unwrap();
    assert_eq!(content.lines().count(), 1);
}
