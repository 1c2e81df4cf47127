use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures::future::join;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CompletionNotification, RunEvent};
use crate::config::NotificationConfig;

/// Delivery attempts per channel: the first try plus one retry.
const DELIVERY_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Notifier {
    config: NotificationConfig,
    logs_dir: Option<PathBuf>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig, logs_dir: Option<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            config,
            logs_dir,
            client,
        }
    }

    /// Record a lifecycle event in the per-run event log.
    pub async fn notify(&self, event: &RunEvent) {
        if !self.config.enabled || !self.config.event_log {
            return;
        }
        self.write_event_log(event).await;
    }

    /// Deliver the completion payload to the webhook and hook command. Delivery
    /// problems are logged and never propagate. Returns `true` when every
    /// configured channel accepted the payload.
    ///
    /// Delivery is at-least-once: the caller records it only after this returns,
    /// so a crash in between sends the payload again on resume.
    pub async fn notify_completion(&self, notification: &CompletionNotification) -> bool {
        if !self.config.enabled {
            return true;
        }

        let json = match serde_json::to_string(notification) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "Failed to serialize completion notification");
                return false;
            }
        };

        let webhook = async {
            match &self.config.webhook_url {
                Some(url) => {
                    self.with_retry("webhook", &notification.run_id, || self.post_webhook(url, &json))
                        .await
                }
                None => true,
            }
        };
        let hook = async {
            match &self.config.hook_command {
                Some(cmd) => {
                    self.with_retry("hook", &notification.run_id, || {
                        self.run_hook(cmd, &notification.run_id, &json)
                    })
                    .await
                }
                None => true,
            }
        };

        let (webhook_ok, hook_ok) = join(webhook, hook).await;
        let delivered = webhook_ok && hook_ok;

        if delivered {
            info!(run_id = %notification.run_id, status = %notification.status, "Completion notification delivered");
        }
        delivered
    }

    async fn with_retry<F, Fut>(&self, channel: &str, run_id: &str, mut send: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match send().await {
                Ok(()) => return true,
                Err(e) if attempt < DELIVERY_ATTEMPTS => {
                    debug!(channel, run_id, error = %e, "Notification delivery failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(channel, run_id, error = %e, "Notification delivery failed");
                }
            }
        }
        false
    }

    async fn post_webhook(&self, url: &str, json: &str) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Pilot-Event", "run.completion")
            .body(json.to_string())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("webhook returned HTTP {}", response.status().as_u16()));
        }
        Ok(())
    }

    async fn run_hook(&self, hook_cmd: &str, run_id: &str, json: &str) -> Result<(), String> {
        let mut command = Command::new("sh");
        command
            .args(["-c", hook_cmd])
            .env("PILOT_EVENT", "run.completion")
            .env("PILOT_RUN_ID", run_id)
            .env("PILOT_EVENT_JSON", json)
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(format!(
                "hook exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("hook timed out after {}s", timeout.as_secs())),
        }
    }

    async fn write_event_log(&self, event: &RunEvent) {
        let Some(logs_dir) = &self.logs_dir else {
            return;
        };

        let log_path = logs_dir.join(format!("{}.log", event.run_id));
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let phase = event.phase.map(|p| p.as_str()).unwrap_or("-");
        let log_line = format!(
            "[{}] {} {}: {}\n",
            timestamp,
            event.event_type.as_str(),
            phase,
            event.message.as_deref().unwrap_or("")
        );

        if let Err(e) = tokio::fs::create_dir_all(logs_dir).await {
            warn!(error = %e, "Failed to create logs directory");
            return;
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;

        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(log_line.as_bytes()).await {
                    warn!(error = %e, "Failed to write event log");
                }
            }
            Err(e) => {
                warn!(error = %e, path = %log_path.display(), "Failed to open event log");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::notification::EventType;
    use crate::run::{ChangeRequest, Phase, Run, RunStatus};

    fn completed_run() -> Run {
        let mut run = Run::new("r-1", ChangeRequest::from_issue(7), "main", "pilot");
        run.mark_terminal(RunStatus::Completed, None);
        run
    }

    #[tokio::test]
    async fn test_event_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let notifier = Notifier::new(NotificationConfig::default(), Some(dir.path().to_path_buf()));

        notifier
            .notify(&RunEvent::new(EventType::RunStarted, "r-1"))
            .await;
        notifier
            .notify(&RunEvent::new(EventType::PhaseStarted, "r-1").with_phase(Phase::Plan))
            .await;

        let log = std::fs::read_to_string(dir.path().join("r-1.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("phase.started plan"));
    }

    #[tokio::test]
    async fn test_hook_receives_payload() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("event.json");
        let config = NotificationConfig {
            hook_command: Some(format!("printf '%s' \"$PILOT_EVENT_JSON\" > {}", out.display())),
            ..Default::default()
        };
        let notifier = Notifier::new(config, None);

        let delivered = notifier
            .notify_completion(&CompletionNotification::from_run(&completed_run()))
            .await;
        assert!(delivered);

        let payload: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(payload["run_id"], "r-1");
        assert_eq!(payload["issue_number"], 7);
    }

    #[tokio::test]
    async fn test_failing_hook_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("count");
        let config = NotificationConfig {
            hook_command: Some(format!("echo x >> {}; exit 1", counter.display())),
            ..Default::default()
        };
        let notifier = Notifier::new(config, None);

        let delivered = notifier
            .notify_completion(&CompletionNotification::from_run(&completed_run()))
            .await;
        assert!(!delivered);
        assert_eq!(std::fs::read_to_string(counter).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_notifier_does_nothing() {
        let dir = TempDir::new().unwrap();
        let config = NotificationConfig {
            enabled: false,
            ..Default::default()
        };
        let notifier = Notifier::new(config, Some(dir.path().to_path_buf()));
        notifier
            .notify(&RunEvent::new(EventType::RunStarted, "r-1"))
            .await;
        assert!(!dir.path().join("r-1.log").exists());
    }
}
