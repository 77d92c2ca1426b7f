//! Explicit orchestration context passed to every component.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::activity::{ActivityLog, PerformanceLog};
use crate::config::FactoryConfig;
use crate::gate::{ResourceGate, SysinfoProbe};
use crate::notify::{spawn_best_effort, Notification, Notifier, WebhookNotifier};
use crate::policy::PolicyHandle;
use crate::publish::{HttpPublisher, Publisher};
use crate::secrets::SecretBundle;
use crate::stages::{CommandStages, Stages};
use crate::store::TaskStore;
use crate::trends::{HttpTrendSource, TrendSource};

/// Handles shared by the service, the dispatcher, and the HTTP surface.
pub struct FactoryContext {
    pub config: FactoryConfig,
    pub data_dir: PathBuf,
    pub store: Arc<dyn TaskStore>,
    pub policy: Arc<PolicyHandle>,
    pub activity: Arc<ActivityLog>,
    pub performance: Arc<PerformanceLog>,
    pub gate: ResourceGate,
    pub stages: Arc<dyn Stages>,
    pub publisher: Arc<dyn Publisher>,
    pub trends: Arc<dyn TrendSource>,
    pub notifier: Arc<dyn Notifier>,
}

/// Resolves `p` against `base` unless it is absolute.
pub fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl FactoryContext {
    /// Production wiring: external commands, HTTP adapters, host probe.
    pub fn from_config(
        config: FactoryConfig,
        data_dir: PathBuf,
        secrets: Arc<SecretBundle>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        let retry = config.retry.policy();
        let model_path = resolve(&data_dir, &config.policy.model_file);
        let policy = PolicyHandle::load(config.policy.agent.clone(), model_path)?;
        let stages = CommandStages::new(
            config.stages.clone(),
            data_dir.clone(),
            Arc::clone(&secrets),
            retry.clone(),
        );
        let publisher = HttpPublisher::new(&config.publish, secrets, retry)?;
        let trends = HttpTrendSource::new(&config.trending)?;
        let notifier = WebhookNotifier::new(&config.notify)?;
        Ok(Self {
            gate: ResourceGate::new(Arc::new(SysinfoProbe), &config.gate),
            activity: Arc::new(ActivityLog::new(data_dir.join("activity.log"))),
            performance: Arc::new(PerformanceLog::new(data_dir.join("performance.json"))),
            policy: Arc::new(policy),
            stages: Arc::new(stages),
            publisher: Arc::new(publisher),
            trends: Arc::new(trends),
            notifier: Arc::new(notifier),
            store,
            data_dir,
            config,
        })
    }

    /// Hands `note` to the notifier in the background.
    pub fn notify(&self, note: Notification) {
        let timeout = Duration::from_secs(self.config.notify.timeout_secs.max(1));
        spawn_best_effort(Arc::clone(&self.notifier), note, timeout);
    }

    /// Worker lease length.
    pub fn lease_ms(&self) -> i64 {
        self.config.schedule.lease_ms.max(1_000)
    }
}
