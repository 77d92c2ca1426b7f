use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use factory_core::model::Platform;
use factory_core::policy::PolicyConfig;
use factory_core::retry::RetryPolicy;
use factory_core::schedule::parse_clock;
use serde::{Deserialize, Serialize};

/// Daemon configuration (`factory.toml`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub listen: SocketAddr,
    pub gate: GateConfig,
    pub policy: PolicySection,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub stages: StagesConfig,
    pub publish: PublishConfig,
    pub trending: TrendingConfig,
    pub notify: NotifyConfig,
    pub storage: StorageConfig,
    pub secrets: SecretsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub cpu_threshold: f32,
    pub ram_threshold: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// Relative paths resolve against the data dir.
    pub model_file: PathBuf,
    #[serde(flatten)]
    pub agent: PolicyConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local `HH:MM` for the daily run; empty disables it.
    pub daily_trigger: String,
    pub secondaries: Vec<SecondarySchedule>,
    pub analytics_delay_hours: u64,
    pub dispatch_interval_ms: u64,
    pub lease_ms: i64,
    pub workers: usize,
}

/// One deferred secondary publication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SecondarySchedule {
    pub platform: Platform,
    /// Local `HH:MM`.
    pub at: String,
    #[serde(default)]
    pub collect_analytics: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

/// External program invocation; args may contain `{placeholders}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub timeout_secs: u64,
    pub script: CommandTemplate,
    pub voice: CommandTemplate,
    pub visuals: CommandTemplate,
    pub subtitles: CommandTemplate,
    pub assemble: CommandTemplate,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlatformEndpoint {
    pub base_url: String,
    /// Name of the bearer token in the secret bundle.
    pub token_secret: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub endpoints: BTreeMap<Platform, PlatformEndpoint>,
    pub hashtags: Vec<String>,
    pub reel_max_duration_sec: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendingConfig {
    pub url: Option<String>,
    pub fallback: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Days to keep backups; 0 keeps them forever.
    pub backup_retention_days: u64,
    pub gc_interval_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub encrypted_file: PathBuf,
    pub plaintext_file: PathBuf,
    pub password_env: String,
    /// Credentials that must be present for startup to proceed.
    pub required: Vec<String>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            gate: GateConfig::default(),
            policy: PolicySection::default(),
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
            stages: StagesConfig::default(),
            publish: PublishConfig::default(),
            trending: TrendingConfig::default(),
            notify: NotifyConfig::default(),
            storage: StorageConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 50.0,
            ram_threshold: 80.0,
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            model_file: PathBuf::from("policy_model.json"),
            agent: PolicyConfig::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_trigger: "09:00".to_string(),
            secondaries: vec![
                SecondarySchedule {
                    platform: Platform::Twitter,
                    at: "18:00".to_string(),
                    collect_analytics: false,
                },
                SecondarySchedule {
                    platform: Platform::Instagram,
                    at: "20:00".to_string(),
                    collect_analytics: true,
                },
            ],
            analytics_delay_hours: 24,
            dispatch_interval_ms: 5_000,
            lease_ms: 600_000,
            workers: 2,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

fn tool(program: &str, args: &[&str]) -> CommandTemplate {
    CommandTemplate {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1_800,
            script: tool(
                "factory-script",
                &["--topic", "{topic}", "--duration", "{duration}", "--out", "{data_dir}/scripts/{slug}.txt"],
            ),
            voice: tool(
                "factory-voice",
                &["--script", "{script}", "--out", "{data_dir}/audio/{slug}.wav"],
            ),
            visuals: tool(
                "factory-visuals",
                &["--topic", "{topic}", "--out-dir", "{data_dir}/images", "--prefix", "{slug}"],
            ),
            subtitles: tool(
                "factory-subtitles",
                &["--audio", "{audio}", "--out-dir", "{data_dir}/subtitles", "--prefix", "{slug}", "--langs", "fa,en,ar"],
            ),
            assemble: tool(
                "factory-assemble",
                &[
                    "--images", "{visuals}", "--audio", "{audio}", "--subtitle", "{subtitle}",
                    "--out", "{data_dir}/videos/{slug}.mp4",
                ],
            ),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        let endpoint = |port: u16, secret: &str| PlatformEndpoint {
            base_url: format!("http://127.0.0.1:{port}"),
            token_secret: secret.to_string(),
        };
        let mut endpoints = BTreeMap::new();
        endpoints.insert(Platform::YouTube, endpoint(9101, "YOUTUBE_TOKEN"));
        endpoints.insert(Platform::Twitter, endpoint(9102, "TWITTER_TOKEN"));
        endpoints.insert(Platform::Instagram, endpoint(9103, "INSTAGRAM_TOKEN"));
        Self {
            endpoints,
            hashtags: vec!["#networking".to_string(), "#mikrotik_tutorial".to_string()],
            reel_max_duration_sec: 90,
            timeout_secs: 300,
        }
    }
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            url: None,
            fallback: vec![
                "MikroTik setup".to_string(),
                "MikroTik firewall".to_string(),
                "MikroTik VPN".to_string(),
            ],
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_retention_days: 0,
            gc_interval_seconds: 3_600,
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            encrypted_file: PathBuf::from(".env.encrypted"),
            plaintext_file: PathBuf::from(".env"),
            password_env: "SECRET_MASTER_PASSWORD".to_string(),
            required: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

impl ScheduleConfig {
    /// Parsed daily trigger time, `None` when disabled.
    pub fn daily_time(&self) -> Result<Option<NaiveTime>> {
        let s = self.daily_trigger.trim();
        if s.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_clock(s)?))
    }

    /// Secondary schedules with parsed clock times.
    pub fn secondary_times(&self) -> Result<Vec<(SecondarySchedule, NaiveTime)>> {
        self.secondaries
            .iter()
            .map(|s| {
                if s.platform.is_primary() {
                    anyhow::bail!("{} is the primary platform and cannot be deferred", s.platform);
                }
                Ok((s.clone(), parse_clock(&s.at)?))
            })
            .collect()
    }
}

impl FactoryConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: FactoryConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save_to(path)?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(cfg);
        }
        Self::load_from(path)
    }

    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("factory.toml")
    }

    pub fn db_path(data_dir: &Path) -> PathBuf {
        data_dir.join("factory.db")
    }

    /// Fails on values that would only surface later inside a background loop.
    pub fn validate(&self) -> Result<()> {
        self.schedule.daily_time()?;
        self.schedule.secondary_times()?;
        let p = &self.policy.agent;
        if !(0.0..=1.0).contains(&p.epsilon) {
            anyhow::bail!("policy.epsilon must be within [0, 1], got {}", p.epsilon);
        }
        if !(0.0..=1.0).contains(&p.trending_override_probability) {
            anyhow::bail!(
                "policy.trending_override_probability must be within [0, 1], got {}",
                p.trending_override_probability
            );
        }
        if !self.publish.endpoints.contains_key(&Platform::YouTube) {
            anyhow::bail!("publish.endpoints must configure the primary platform (youtube)");
        }
        Ok(())
    }
}
