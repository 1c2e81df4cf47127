use run_pilot::config::{CONFIG_FILE, PilotConfig, RetentionPolicy};
use run_pilot::error::PilotError;
use tempfile::TempDir;

#[tokio::test]
async fn test_missing_file_loads_defaults() {
    let dir = TempDir::new().unwrap();
    let config = PilotConfig::load(dir.path()).await.unwrap();

    assert_eq!(config.review.max_patch_iterations, 3);
    assert_eq!(config.workspace.retention, RetentionPolicy::OnSuccess);
    assert_eq!(config.allocator.port_base, 20000);
}

#[tokio::test]
async fn test_save_then_load_keeps_values() {
    let dir = TempDir::new().unwrap();
    let mut config = PilotConfig::default();
    config.review.max_patch_iterations = 1;
    config.allocator.port_base = 31000;
    config.workspace.retention = RetentionPolicy::Never;
    config.notification.hook_command = Some("echo done".into());
    config.save(dir.path()).await.unwrap();

    assert!(dir.path().join(CONFIG_FILE).exists());
    let loaded = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(loaded.review.max_patch_iterations, 1);
    assert_eq!(loaded.allocator.port_base, 31000);
    assert_eq!(loaded.workspace.retention, RetentionPolicy::Never);
    assert_eq!(loaded.notification.hook_command.as_deref(), Some("echo done"));
}

#[tokio::test]
async fn test_invalid_file_is_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        "[allocator]\nslot_count = 0\n",
    )
    .unwrap();

    let err = PilotConfig::load(dir.path()).await.unwrap_err();
    assert!(matches!(err, PilotError::Config(ref msg) if msg.contains("slot_count")));
}

#[tokio::test]
async fn test_invalid_config_is_not_saved() {
    let dir = TempDir::new().unwrap();
    let mut config = PilotConfig::default();
    config.agent.command = "  ".into();

    assert!(config.save(dir.path()).await.is_err());
    assert!(!dir.path().join(CONFIG_FILE).exists());
}
