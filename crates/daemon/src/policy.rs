//! Shared handle to the persisted policy agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use factory_core::model::EngagementMetrics;
use factory_core::policy::{LearnOutcome, PolicyAgent, PolicyConfig, PolicyState, Selection, ACTION_DIM};
use tokio::sync::Mutex;

use crate::activity::write_atomic;

/// In-memory working copy of the model, flushed to disk after every update.
///
/// Learn calls inside this process are serialized; separate processes
/// sharing the file can still race.
pub struct PolicyHandle {
    path: PathBuf,
    agent: Mutex<PolicyAgent>,
}

impl PolicyHandle {
    /// Loads `path`, or starts an untrained model when it does not exist.
    pub fn load(config: PolicyConfig, path: PathBuf) -> Result<Self> {
        let agent = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let agent = PolicyAgent::from_json(config, &json)
                .with_context(|| format!("load policy model {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                backend = ?agent.model().kind(),
                transitions = agent.memory().len(),
                "policy model loaded"
            );
            agent
        } else {
            tracing::info!(path = %path.display(), backend = ?config.backend, "starting untrained policy model");
            PolicyAgent::new(config, &mut rand::thread_rng())
        };
        Ok(Self {
            path,
            agent: Mutex::new(agent),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn select(&self, state: PolicyState, trending: &[String]) -> Selection {
        let agent = self.agent.lock().await;
        let mut rng = rand::thread_rng();
        agent.select(state, trending, &mut rng)
    }

    /// Updates the model and persists it when anything changed.
    pub async fn learn(
        &self,
        state: PolicyState,
        topic: &str,
        metrics: &EngagementMetrics,
    ) -> Result<LearnOutcome> {
        let mut agent = self.agent.lock().await;
        let outcome = {
            let mut rng = rand::thread_rng();
            agent.learn(state, topic, metrics, &mut rng)
        };
        if let LearnOutcome::Updated { .. } = outcome {
            let json = agent.to_json()?;
            write_atomic(&self.path, json.as_bytes()).await?;
        }
        Ok(outcome)
    }

    pub async fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM] {
        self.agent.lock().await.values(state)
    }
}
