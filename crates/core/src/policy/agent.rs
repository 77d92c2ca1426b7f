use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::state::{action_for_topic, topic_for_action, ACTION_DIM};
use super::{
    BackendKind, PolicyModel, PolicyState, ReplayMemory, TabularModel, Transition, ValueModel,
    ValueNetwork,
};
use crate::feedback;
use crate::model::{EngagementMetrics, LengthCategory};

/// Agent hyperparameters (the `[policy]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Value backend.
    pub backend: BackendKind,
    /// Exploration rate.
    pub epsilon: f64,
    /// Chance of swapping a non-trending pick for a trending topic.
    pub trending_override_probability: f64,
    /// Tabular step size.
    pub learning_rate: f64,
    /// Adam step size for the parametric backend.
    pub nn_learning_rate: f32,
    /// Transitions kept for replay.
    pub replay_capacity: usize,
    /// Replay sample size per parametric step.
    pub batch_size: usize,
    /// Hidden layer width of the parametric backend.
    pub hidden_units: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Tabular,
            epsilon: 0.1,
            trending_override_probability: 0.5,
            learning_rate: 0.1,
            nn_learning_rate: 1e-4,
            replay_capacity: 10_000,
            batch_size: 128,
            hidden_units: 128,
        }
    }
}

/// Result of [`PolicyAgent::select`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Topic to produce.
    pub topic: String,
    /// Length bucket of `state`.
    pub length_category: LengthCategory,
    /// Target duration for the script stage.
    pub estimated_duration_sec: u32,
    /// State the pick was made in.
    pub state: PolicyState,
    /// Action index, or `None` when a trending topic outside the action set won.
    pub action: Option<usize>,
    /// Whether the pick was an exploration step.
    pub explored: bool,
    /// Whether the trending override replaced the policy's pick.
    pub trend_override: bool,
}

/// Result of [`PolicyAgent::learn`].
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    /// Topic outside the action set; nothing was updated.
    Skipped {
        /// The topic that matched no action.
        topic: String,
    },
    /// The transition was recorded and the backend updated.
    Updated {
        /// Scalar reward computed from the metrics.
        reward: f64,
        /// New table value (tabular) or training loss (parametric), when a step ran.
        value: Option<f64>,
    },
}

impl LearnOutcome {
    /// Reward, when one was learned.
    pub fn reward(&self) -> Option<f64> {
        match self {
            LearnOutcome::Skipped { .. } => None,
            LearnOutcome::Updated { reward, .. } => Some(*reward),
        }
    }
}

/// Why a policy model could not be restored or written.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The model file was trained with a different backend than configured.
    #[error("model file holds a {found:?} backend but config selects {configured:?}")]
    BackendMismatch {
        /// Backend stored in the file.
        found: BackendKind,
        /// Backend selected by configuration.
        configured: BackendKind,
    },
    /// The model file is not valid JSON for a persisted policy.
    #[error("parse policy model")]
    Parse(#[source] serde_json::Error),
    /// The in-memory model could not be serialized.
    #[error("serialize policy model")]
    Serialize(#[source] serde_json::Error),
}

/// On-disk form of the agent: backend weights plus replay memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPolicy {
    /// Backend weights.
    pub model: PolicyModel,
    /// Replay memory.
    pub memory: ReplayMemory,
}

/// Epsilon-greedy topic selector with online updates.
#[derive(Debug, Clone)]
pub struct PolicyAgent {
    config: PolicyConfig,
    model: PolicyModel,
    memory: ReplayMemory,
}

impl PolicyAgent {
    /// Fresh agent with an untrained backend.
    pub fn new<R: Rng + ?Sized>(config: PolicyConfig, rng: &mut R) -> Self {
        let model = match config.backend {
            BackendKind::Tabular => PolicyModel::Tabular {
                table: TabularModel::new(),
            },
            BackendKind::Parametric => PolicyModel::Parametric {
                network: ValueNetwork::new(config.hidden_units, rng),
            },
        };
        let memory = ReplayMemory::new(config.replay_capacity);
        Self {
            config,
            model,
            memory,
        }
    }

    /// Restores an agent; the persisted backend must match the configured one.
    pub fn from_persisted(config: PolicyConfig, persisted: PersistedPolicy) -> Result<Self, PolicyError> {
        let found = persisted.model.kind();
        if found != config.backend {
            return Err(PolicyError::BackendMismatch {
                found,
                configured: config.backend,
            });
        }
        let mut memory = ReplayMemory::new(config.replay_capacity);
        for t in persisted.memory.iter() {
            memory.push(*t);
        }
        Ok(Self {
            config,
            model: persisted.model,
            memory,
        })
    }

    /// Parses a model file written by [`PolicyAgent::to_json`].
    pub fn from_json(config: PolicyConfig, json: &str) -> Result<Self, PolicyError> {
        let persisted: PersistedPolicy = serde_json::from_str(json).map_err(PolicyError::Parse)?;
        Self::from_persisted(config, persisted)
    }

    /// Serializes the backend and replay memory.
    pub fn to_json(&self) -> Result<String, PolicyError> {
        let persisted = PersistedPolicy {
            model: self.model.clone(),
            memory: self.memory.clone(),
        };
        serde_json::to_string(&persisted).map_err(PolicyError::Serialize)
    }

    /// Active configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Current backend.
    pub fn model(&self) -> &PolicyModel {
        &self.model
    }

    /// Replay memory.
    pub fn memory(&self) -> &ReplayMemory {
        &self.memory
    }

    /// Value of every action in `state`.
    pub fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM] {
        self.model.values(state)
    }

    /// Chooses a topic for `state`.
    ///
    /// With probability epsilon a uniformly random action, else the arg-max.
    /// A pick that is not trending is replaced by a random trending topic with
    /// probability `trending_override_probability`.
    pub fn select<R: Rng + ?Sized>(
        &self,
        state: PolicyState,
        trending: &[String],
        rng: &mut R,
    ) -> Selection {
        let explored = rng.gen::<f64>() < self.config.epsilon;
        let action = if explored {
            rng.gen_range(0..ACTION_DIM)
        } else {
            self.model.best_action(&state)
        };
        let mut topic = topic_for_action(action).unwrap_or_default().to_string();
        let mut chosen = Some(action);
        let mut trend_override = false;

        let is_trending = trending.iter().any(|t| t.eq_ignore_ascii_case(&topic));
        if !trending.is_empty()
            && !is_trending
            && rng.gen::<f64>() < self.config.trending_override_probability
        {
            if let Some(t) = trending.choose(rng) {
                tracing::info!(policy_pick = %topic, trending = %t, "trending topic overrides policy pick");
                chosen = action_for_topic(t);
                // In-set trends take the action's canonical spelling.
                topic = chosen
                    .and_then(topic_for_action)
                    .map_or_else(|| t.clone(), str::to_string);
                trend_override = true;
            }
        }

        Selection {
            topic,
            length_category: state.length,
            estimated_duration_sec: state.length.estimated_duration_sec(),
            state,
            action: chosen,
            explored,
            trend_override,
        }
    }

    /// Feeds engagement for a produced topic back into the model.
    ///
    /// Every decision is a single-step episode: the target is the reward alone.
    pub fn learn<R: Rng + ?Sized>(
        &mut self,
        state: PolicyState,
        topic: &str,
        metrics: &EngagementMetrics,
        rng: &mut R,
    ) -> LearnOutcome {
        let Some(action) = action_for_topic(topic) else {
            tracing::warn!(%topic, "topic outside the action set; skipping policy update");
            return LearnOutcome::Skipped {
                topic: topic.to_string(),
            };
        };
        let reward = feedback::reward(metrics);
        let transition = Transition {
            state,
            action,
            reward,
        };
        self.memory.push(transition);

        let value = match &mut self.model {
            PolicyModel::Tabular { table } => {
                Some(table.update(&transition, self.config.learning_rate))
            }
            PolicyModel::Parametric { network } => self
                .memory
                .sample(self.config.batch_size, rng)
                .map(|batch| network.train_step(&batch, self.config.nn_learning_rate) as f64),
        };
        tracing::debug!(%topic, action, reward, ?value, "policy updated");
        LearnOutcome::Updated { reward, value }
    }
}
