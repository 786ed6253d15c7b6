//! Run reports to a Slack-style incoming webhook.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;
use crate::utils::Result;

const ICON: &str = ":floppy_disk:";

/// One titled line of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub title: String,
    pub value: String,
}

impl Field {
    pub fn new(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub successes: Vec<Field>,
    pub failures: Vec<Field>,
}

/// Delivers notifications. Delivery problems are logged, never returned.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()>;
}

/// Webhook notifier when one is configured, log-only otherwise.
pub fn from_config(cfg: &NotifyConfig) -> Arc<dyn Notifier> {
    match &cfg.webhook {
        Some(url) if !url.trim().is_empty() => Arc::new(SlackNotifier::new(
            url.clone(),
            cfg.channel.clone(),
            cfg.username.clone(),
        )),
        _ => {
            info!("No webhook configured, run reports go to the log only");
            Arc::new(LogNotifier)
        }
    }
}

pub fn slack_payload(notification: &Notification, channel: &str, username: &str) -> serde_json::Value {
    let mut attachments = vec![json!({
        "pretext": notification.title,
        "color": "good",
        "fallback": "Postgres Backup Status:\n",
        "fields": notification.successes,
    })];
    if !notification.failures.is_empty() {
        attachments.push(json!({
            "pretext": "Failures: ",
            "color": "danger",
            "fallback": "Postgres Backup Errors:\n",
            "fields": notification.failures,
        }));
    }

    json!({
        "username": username,
        "icon_emoji": ICON,
        "channel": channel,
        "attachments": attachments,
    })
}

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook: String,
    channel: String,
    username: String,
}

impl SlackNotifier {
    pub fn new(webhook: String, channel: String, username: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook,
            channel,
            username,
        }
    }

    async fn send(&self, notification: &Notification) -> Result<String> {
        let payload = slack_payload(notification, &self.channel, &self.username);
        let response = self
            .client
            .post(&self.webhook)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

impl Notifier for SlackNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let successes = notification.successes.len();
            let failures = notification.failures.len();
            match self.send(notification).await {
                Ok(reply) => info!(successes, failures, "Sent slack msg, received {} from Slack", reply),
                Err(e) => error!(successes, failures, "{}: slack delivery failed: {}", notification.title, e),
            }
        })
    }
}

/// Writes the report to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!("{}", notification.title);
            for field in &notification.successes {
                info!("{}: {}", field.title, field.value);
            }
            for field in &notification.failures {
                warn!("{}: {}", field.title, field.value);
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every notification it is handed
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()> {
            self.sent.lock().unwrap().push(notification.clone());
            Box::pin(async {})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(failures: Vec<Field>) -> Notification {
        Notification {
            title: "Cron job report for *db1*".to_string(),
            successes: vec![Field::new("Daily Backup", "Backup: pushed base_1")],
            failures,
        }
    }

    #[test]
    fn test_payload_without_failures() {
        let payload = slack_payload(&notification(vec![]), "@dev-events", "Postgres-Backup-Status");
        assert_eq!(payload["username"], "Postgres-Backup-Status");
        assert_eq!(payload["icon_emoji"], ":floppy_disk:");
        assert_eq!(payload["channel"], "@dev-events");

        let attachments = payload["attachments"].as_array().unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0]["color"], "good");
        assert_eq!(attachments[0]["pretext"], "Cron job report for *db1*");
        assert_eq!(attachments[0]["fields"][0]["title"], "Daily Backup");
        assert_eq!(attachments[0]["fields"][0]["value"], "Backup: pushed base_1");
    }

    #[test]
    fn test_payload_with_failures() {
        let failures = vec![Field::new("Daily Delete", "Daily backup failed so not doing Daily Delete")];
        let payload = slack_payload(&notification(failures), "#ops", "bot");
        let attachments = payload["attachments"].as_array().unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[1]["color"], "danger");
        assert_eq!(attachments[1]["pretext"], "Failures: ");
        assert_eq!(attachments[1]["fields"][0]["title"], "Daily Delete");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let notifier = SlackNotifier::new(
            "http://127.0.0.1:9/hook".to_string(),
            "#ops".to_string(),
            "bot".to_string(),
        );
        notifier.notify(&notification(vec![])).await;
    }
}
