//! Severity-leveled notification dispatch.
//!
//! Events below the configured minimum level are dropped. Everything else is
//! appended to the history store's event log first (so notification history
//! stays queryable even when every transport is down), then delivered to each
//! enabled channel independently: process log, desktop alert, email, webhook.
//! A channel failure is logged and never fails the caller.

use crate::config::NotificationConfig;
use crate::constants::notifications;
use crate::database::records::{NotificationEventRecord, NotificationLevel};
use crate::database::Database;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
struct WebhookPayload {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    title: String,
    message: String,
    operation: Option<String>,
    hostname: String,
}

pub struct NotificationDispatcher {
    config: NotificationConfig,
    min_level: NotificationLevel,
    database: Arc<Database>,
    client: Client,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig, database: Arc<Database>) -> Self {
        let min_level = NotificationLevel::from_str(&config.level).unwrap_or_else(|_| {
            warn!(
                "Unknown notification level '{}', defaulting to INFO",
                config.level
            );
            NotificationLevel::Info
        });

        let client = Client::builder()
            .timeout(notifications::WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config,
            min_level,
            database,
            client,
        }
    }

    pub fn min_level(&self) -> NotificationLevel {
        self.min_level
    }

    /// Sends one event. Returns the stored record id when the event cleared
    /// the threshold, `None` when it was dropped.
    pub async fn send(
        &self,
        level: NotificationLevel,
        title: &str,
        message: &str,
        operation: Option<&str>,
    ) -> Option<String> {
        if level < self.min_level {
            debug!(
                "Dropping {} event '{}' below threshold {}",
                level, title, self.min_level
            );
            return None;
        }

        let event = NotificationEventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            title: title.to_string(),
            message: message.to_string(),
            operation: operation.map(str::to_string),
        };

        // The event log is appended before any delivery attempt
        if let Err(e) = self.database.append_notification_event(&event).await {
            error!("Failed to append notification event '{}': {}", title, e);
        }

        self.log_channel(&event);
        self.desktop_channel(&event).await;
        self.email_channel(&event).await;
        self.webhook_channel(&event).await;

        Some(event.id)
    }

    fn log_channel(&self, event: &NotificationEventRecord) {
        match event.level {
            NotificationLevel::Debug => debug!("{}: {}", event.title, event.message),
            NotificationLevel::Info => info!("{}: {}", event.title, event.message),
            NotificationLevel::Warn => warn!("{}: {}", event.title, event.message),
            NotificationLevel::Error | NotificationLevel::Critical => {
                error!("{}: {}", event.title, event.message)
            }
        }
    }

    async fn desktop_channel(&self, event: &NotificationEventRecord) {
        if !self.config.desktop_enabled {
            return;
        }
        if std::env::var("DISPLAY").is_err() && std::env::var("WAYLAND_DISPLAY").is_err() {
            debug!("No display session, skipping desktop notification");
            return;
        }

        let urgency = match event.level {
            NotificationLevel::Error | NotificationLevel::Critical => "critical",
            NotificationLevel::Warn => "normal",
            _ => "low",
        };

        let result = timeout(
            notifications::CHANNEL_COMMAND_TIMEOUT,
            AsyncCommand::new(notifications::DESKTOP_COMMAND)
                .arg("--urgency")
                .arg(urgency)
                .arg(&event.title)
                .arg(&event.message)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                debug!("Desktop notification delivered: {}", event.title);
            }
            Ok(Ok(output)) => warn!(
                "Desktop notification failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(e)) => warn!("Desktop notification could not run: {}", e),
            Err(_) => warn!("Desktop notification timed out"),
        }
    }

    async fn email_channel(&self, event: &NotificationEventRecord) {
        if !self.config.email_enabled {
            return;
        }
        let Some(recipient) = self.config.email_to.as_deref() else {
            debug!("Email enabled but no recipient configured, skipping");
            return;
        };

        let subject = format!("[sysmaint {}] {}", event.level, event.title);
        let body = match &event.operation {
            Some(operation) => format!("{}\n\noperation: {}", event.message, operation),
            None => event.message.clone(),
        };

        let result = timeout(notifications::CHANNEL_COMMAND_TIMEOUT, async {
            let mut child = AsyncCommand::new(notifications::EMAIL_COMMAND)
                .arg("-s")
                .arg(&subject)
                .arg(recipient)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(body.as_bytes()).await?;
                drop(stdin);
            }
            child.wait().await
        })
        .await;

        match result {
            Ok(Ok(status)) if status.success() => {
                debug!("Email notification sent to {}", recipient);
            }
            Ok(Ok(status)) => warn!("Email transport exited with {}", status),
            Ok(Err(e)) => warn!("Email transport unavailable: {}", e),
            Err(_) => warn!("Email transport timed out"),
        }
    }

    async fn webhook_channel(&self, event: &NotificationEventRecord) {
        let Some(url) = self.config.webhook_url.as_deref() else {
            return;
        };

        let payload = WebhookPayload {
            timestamp: event.timestamp,
            level: event.level.as_str().to_string(),
            title: event.title.clone(),
            message: event.message.clone(),
            operation: event.operation.clone(),
            hostname: hostname(),
        };

        match timeout(
            notifications::WEBHOOK_TIMEOUT,
            self.client.post(url).json(&payload).send(),
        )
        .await
        {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!("Webhook delivered: {}", event.title);
            }
            Ok(Ok(response)) => {
                warn!("Webhook returned status {} for '{}'", response.status(), event.title)
            }
            Ok(Err(e)) => warn!("Webhook delivery failed for '{}': {}", event.title, e),
            Err(_) => warn!("Webhook timed out for '{}'", event.title),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

impl Clone for NotificationDispatcher {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            min_level: self.min_level,
            database: self.database.clone(),
            client: self.client.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn dispatcher_with(
        config: NotificationConfig,
    ) -> (TempDir, Arc<Database>, NotificationDispatcher) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.db");
        let database = Arc::new(Database::new(path.to_str().unwrap(), 90).await.unwrap());
        let dispatcher = NotificationDispatcher::new(config, database.clone());
        (dir, database, dispatcher)
    }

    fn silent_config(level: &str) -> NotificationConfig {
        NotificationConfig {
            level: level.to_string(),
            desktop_enabled: false,
            email_enabled: false,
            email_to: None,
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn test_event_below_threshold_is_dropped() {
        let (_dir, database, dispatcher) = dispatcher_with(silent_config("WARN")).await;

        let id = dispatcher
            .send(NotificationLevel::Info, "routine", "run finished", None)
            .await;

        assert!(id.is_none());
        assert!(database.recent_notification_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_is_stored_without_any_channel() {
        let (_dir, database, dispatcher) = dispatcher_with(silent_config("INFO")).await;

        let id = dispatcher
            .send(
                NotificationLevel::Critical,
                "Rollback failed",
                "manual intervention required",
                Some("kernel_packages"),
            )
            .await;

        assert!(id.is_some());
        let events = database.recent_notification_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, NotificationLevel::Critical);
        assert_eq!(events[0].operation.as_deref(), Some("kernel_packages"));
    }

    #[tokio::test]
    async fn test_unknown_level_defaults_to_info() {
        let (_dir, _database, dispatcher) = dispatcher_with(silent_config("chatty")).await;
        assert_eq!(dispatcher.min_level(), NotificationLevel::Info);
    }
}
