use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::TrendingConfig;

/// External trending-topic signal used to override policy picks.
#[async_trait]
pub trait TrendSource: Send + Sync {
    async fn trending(&self) -> Result<Vec<String>>;
}

/// Fixed list.
pub struct StaticTrends(pub Vec<String>);

#[async_trait]
impl TrendSource for StaticTrends {
    async fn trending(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Fetches a JSON array of topics; falls back to the static list on error.
pub struct HttpTrendSource {
    client: reqwest::Client,
    url: Option<String>,
    fallback: Vec<String>,
}

impl HttpTrendSource {
    pub fn new(cfg: &TrendingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("build trends http client")?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
            fallback: cfg.fallback.clone(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<String>> {
        let topics: Vec<String> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect())
    }
}

#[async_trait]
impl TrendSource for HttpTrendSource {
    async fn trending(&self) -> Result<Vec<String>> {
        let Some(url) = &self.url else {
            return Ok(self.fallback.clone());
        };
        match self.fetch(url).await {
            Ok(topics) if !topics.is_empty() => Ok(topics),
            Ok(_) => Ok(self.fallback.clone()),
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "trending fetch failed; using fallback topics");
                Ok(self.fallback.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_falls_back() {
        let cfg = TrendingConfig {
            url: Some("http://127.0.0.1:9/trending".into()),
            ..TrendingConfig::default()
        };
        let src = HttpTrendSource::new(&cfg).unwrap();
        assert_eq!(
            src.trending().await.unwrap(),
            ["MikroTik setup", "MikroTik firewall", "MikroTik VPN"]
        );
    }
}
