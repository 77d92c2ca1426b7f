//! Platform publication adapters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use factory_core::model::{EngagementMetrics, Platform};
use factory_core::retry::{FailureClass, RetryPolicy};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::{PlatformEndpoint, PublishConfig};
use crate::retry::retry_if;
use crate::secrets::SecretBundle;

/// Video title shown on every platform.
pub fn title(topic: &str) -> String {
    format!("آموزش میکروتیک: {topic}")
}

fn topic_tag(topic: &str) -> String {
    format!("#{}", topic.replace(' ', ""))
}

/// Long-form description with topic and configured hashtags.
pub fn description(topic: &str, hashtags: &[String]) -> String {
    let mut tags = vec![
        "#MikroTik".to_string(),
        "#tutorial".to_string(),
        "#Persian".to_string(),
        topic_tag(topic),
    ];
    tags.extend(hashtags.iter().cloned());
    format!("در این ویدیو به آموزش {topic} می‌پردازیم.\n\n{}", tags.join(" "))
}

/// Short teaser linking the primary upload.
pub fn teaser(topic: &str, primary_id: &str) -> String {
    format!(
        "ویدیوی جدید در کانال یوتیوب ما: {}\nhttps://youtu.be/{primary_id}\n\n#MikroTik {}",
        title(topic),
        topic_tag(topic)
    )
}

/// Upload request for the primary platform.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PrimaryPost {
    pub topic: String,
    pub title: String,
    pub description: String,
    pub video_path: PathBuf,
    pub subtitle_paths: Vec<PathBuf>,
}

impl PrimaryPost {
    pub fn new(topic: &str, video_path: PathBuf, subtitle_paths: Vec<PathBuf>, hashtags: &[String]) -> Self {
        Self {
            topic: topic.to_string(),
            title: title(topic),
            description: description(topic, hashtags),
            video_path,
            subtitle_paths,
        }
    }
}

/// Post for a secondary platform; references the primary content id.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SecondaryPost {
    pub topic: String,
    pub text: String,
    pub primary_id: String,
    /// Absent for text-only platforms.
    pub video_path: Option<PathBuf>,
    /// Clip length cap for reels.
    pub max_duration_sec: Option<f64>,
}

impl SecondaryPost {
    pub fn new(
        platform: Platform,
        topic: &str,
        primary_id: &str,
        video_path: PathBuf,
        duration_sec: f64,
        reel_max_sec: u32,
    ) -> Self {
        let text = match platform {
            Platform::Twitter => teaser(topic, primary_id),
            _ => title(topic),
        };
        let needs_video = platform.needs_video();
        Self {
            topic: topic.to_string(),
            text,
            primary_id: primary_id.to_string(),
            video_path: needs_video.then_some(video_path),
            max_duration_sec: needs_video.then(|| duration_sec.min(f64::from(reel_max_sec))),
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Uploads to the primary platform. `Ok(None)` means the platform
    /// accepted the call but returned no content id.
    async fn publish_primary(&self, post: &PrimaryPost) -> Result<Option<String>>;
    async fn publish_secondary(&self, platform: Platform, post: &SecondaryPost) -> Result<Option<String>>;
    async fn fetch_engagement(&self, platform: Platform, content_id: &str) -> Result<EngagementMetrics>;
}

/// Error from a platform endpoint, classified for retry.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{platform}: no endpoint configured")]
    NoEndpoint { platform: Platform },
    #[error("{platform}: credential {name} missing from secret bundle")]
    MissingToken { platform: Platform, name: String },
    #[error("{platform}: content {id} is gone")]
    Gone { platform: Platform, id: String },
    #[error("{platform}: http {status}: {body}")]
    Status {
        platform: Platform,
        status: StatusCode,
        body: String,
    },
    #[error("{platform}: {source}")]
    Transport {
        platform: Platform,
        #[source]
        source: reqwest::Error,
    },
}

impl PublishError {
    pub fn class(&self) -> FailureClass {
        match self {
            PublishError::Status { status, .. }
                if *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() =>
            {
                FailureClass::Transient
            }
            PublishError::Transport { source, .. } if source.is_connect() || source.is_timeout() => {
                FailureClass::Transient
            }
            _ => FailureClass::Permanent,
        }
    }
}

#[derive(Deserialize)]
struct PublishReply {
    #[serde(default)]
    id: Option<String>,
}

/// JSON-over-HTTP adapter; one endpoint per platform.
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoints: BTreeMap<Platform, PlatformEndpoint>,
    secrets: Arc<SecretBundle>,
    retry: RetryPolicy,
}

impl HttpPublisher {
    pub fn new(cfg: &PublishConfig, secrets: Arc<SecretBundle>, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .context("build publisher http client")?;
        Ok(Self {
            client,
            endpoints: cfg.endpoints.clone(),
            secrets,
            retry,
        })
    }

    fn endpoint(&self, platform: Platform) -> Result<(&PlatformEndpoint, &str), PublishError> {
        let ep = self
            .endpoints
            .get(&platform)
            .ok_or(PublishError::NoEndpoint { platform })?;
        let token = self
            .secrets
            .get(&ep.token_secret)
            .ok_or_else(|| PublishError::MissingToken {
                platform,
                name: ep.token_secret.clone(),
            })?;
        Ok((ep, token))
    }

    async fn check(platform: Platform, id: Option<&str>, resp: reqwest::Response) -> Result<reqwest::Response, PublishError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if let (Some(id), StatusCode::NOT_FOUND | StatusCode::GONE) = (id, status) {
            return Err(PublishError::Gone {
                platform,
                id: id.to_string(),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PublishError::Status { platform, status, body })
    }

    async fn post_once<T: Serialize + Sync>(&self, platform: Platform, body: &T) -> Result<Option<String>, PublishError> {
        let (ep, token) = self.endpoint(platform)?;
        let url = format!("{}/publish", ep.base_url.trim_end_matches('/'));
        let transport = |source| PublishError::Transport { platform, source };
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let reply: PublishReply = Self::check(platform, None, resp)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(reply.id.filter(|id| !id.trim().is_empty()))
    }

    async fn post<T: Serialize + Sync>(&self, platform: Platform, body: &T) -> Result<Option<String>> {
        let what = format!("publish:{platform}");
        retry_if(&self.retry, &what, || self.post_once(platform, body), PublishError::class)
            .await
            .map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish_primary(&self, post: &PrimaryPost) -> Result<Option<String>> {
        self.post(Platform::YouTube, post).await
    }

    async fn publish_secondary(&self, platform: Platform, post: &SecondaryPost) -> Result<Option<String>> {
        if platform.is_primary() {
            return Err(anyhow!("{platform} is not a secondary platform"));
        }
        self.post(platform, post).await
    }

    async fn fetch_engagement(&self, platform: Platform, content_id: &str) -> Result<EngagementMetrics> {
        let what = format!("metrics:{platform}");
        let metrics = retry_if(
            &self.retry,
            &what,
            || async {
                let (ep, token) = self.endpoint(platform)?;
                let url = format!("{}/metrics/{content_id}", ep.base_url.trim_end_matches('/'));
                let transport = |source| PublishError::Transport { platform, source };
                let resp = self
                    .client
                    .get(url)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(transport)?;
                Self::check(platform, Some(content_id), resp)
                    .await?
                    .json::<EngagementMetrics>()
                    .await
                    .map_err(transport)
            },
            PublishError::class,
        )
        .await?;
        Ok(metrics)
    }
}
