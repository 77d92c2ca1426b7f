//! Best-effort operator notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use factory_core::model::{Platform, StageName};
use serde::Serialize;
use tracing::Instrument;

use crate::config::NotifyConfig;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A pipeline stage aborted its run.
    StageFailure {
        run_id: String,
        topic: String,
        stage: StageName,
        message: String,
        /// Full error chain and backtrace.
        diagnostic: String,
    },
    Published {
        platform: Platform,
        topic: String,
        content_id: String,
    },
    PublishFailed {
        platform: Platform,
        topic: String,
        error: String,
    },
}

impl Notification {
    pub fn subject(&self) -> String {
        match self {
            Notification::StageFailure { stage, topic, .. } => {
                format!("Run failed at {stage} stage: {topic}")
            }
            Notification::Published { platform, topic, .. } => {
                format!("Published to {platform}: {topic}")
            }
            Notification::PublishFailed { platform, topic, .. } => {
                format!("Publishing to {platform} failed: {topic}")
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::StageFailure {
                run_id,
                message,
                diagnostic,
                ..
            } => format!("run {run_id}\n\n{message}\n\n{diagnostic}"),
            Notification::Published { content_id, .. } => format!("content id {content_id}"),
            Notification::PublishFailed { error, .. } => error.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, note: &Notification) -> Result<()>;
}

/// Posts `{subject, body, event}` JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(cfg: &NotifyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .context("build notifier http client")?;
        Ok(Self {
            client,
            url: cfg.webhook_url.clone(),
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: String,
    body: String,
    event: &'a Notification,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, note: &Notification) -> Result<()> {
        let Some(url) = &self.url else {
            tracing::warn!(subject = %note.subject(), "no notification webhook configured; dropping");
            return Ok(());
        };
        let payload = WebhookPayload {
            subject: note.subject(),
            body: note.body(),
            event: note,
        };
        self.client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("send notification")?
            .error_for_status()
            .context("notification rejected")?;
        Ok(())
    }
}

/// Sends `note` within `timeout`; failures are logged and swallowed.
pub async fn notify_best_effort(notifier: &dyn Notifier, note: Notification, timeout: Duration) {
    match tokio::time::timeout(timeout, notifier.send(&note)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, subject = %note.subject(), "notification failed"),
        Err(_) => tracing::warn!(subject = %note.subject(), "notification timed out"),
    }
}

/// Sends `note` on its own task so the caller never waits on the notifier.
pub fn spawn_best_effort(
    notifier: Arc<dyn Notifier>,
    note: Notification,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::Span::current();
    tokio::spawn(
        async move { notify_best_effort(notifier.as_ref(), note, timeout).await }
            .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn send(&self, _note: &Notification) -> Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    struct Hangs;

    #[async_trait]
    impl Notifier for Hangs {
        async fn send(&self, _note: &Notification) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn failure() -> Notification {
        Notification::StageFailure {
            run_id: "r1".into(),
            topic: "MikroTik QoS".into(),
            stage: StageName::Voice,
            message: "tts offline".into(),
            diagnostic: "tts offline\n\nStack backtrace: ...".into(),
        }
    }

    #[test]
    fn stage_failure_names_the_stage() {
        let n = failure();
        assert_eq!(n.subject(), "Run failed at voice stage: MikroTik QoS");
        assert!(n.body().contains("Stack backtrace"));
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["event"], "stage_failure");
        assert_eq!(json["stage"], "voice");
    }

    #[tokio::test]
    async fn best_effort_never_fails() {
        notify_best_effort(&Broken, failure(), Duration::from_millis(50)).await;
        notify_best_effort(&Hangs, failure(), Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn spawned_send_does_not_hold_the_caller() {
        let started = std::time::Instant::now();
        let handle = spawn_best_effort(Arc::new(Hangs), failure(), Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(100));
        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn webhook_without_url_is_a_no_op() {
        let n = WebhookNotifier::new(&NotifyConfig::default()).unwrap();
        n.send(&failure()).await.unwrap();
    }
}
