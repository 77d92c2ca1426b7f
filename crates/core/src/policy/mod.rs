//! Content-selection policy: a single-step bandit over a closed topic set.
//!
//! One agent, two interchangeable value backends (tabular and a small
//! neural network), selected by [`BackendKind`].

mod agent;
mod dqn;
mod memory;
mod state;
mod tabular;

pub use agent::{LearnOutcome, PersistedPolicy, PolicyAgent, PolicyConfig, PolicyError, Selection};
pub use dqn::ValueNetwork;
pub use memory::{ReplayMemory, Transition};
pub use state::{
    action_for_topic, topic_for_action, PolicyState, ACTION_DIM, LENGTH_CATEGORIES,
    POSSIBLE_TOPICS, STATE_DIM, TOPIC_CATEGORIES,
};
pub use tabular::TabularModel;

use serde::{Deserialize, Serialize};

/// Which value backend the agent uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Sparse (state, action) table.
    #[default]
    Tabular,
    /// Three-layer value network.
    Parametric,
}

/// Predicts a value for every action in a state.
pub trait ValueModel {
    /// Value of each action, indexed like `POSSIBLE_TOPICS`.
    fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM];

    /// Highest-valued action; ties resolve to the lowest index.
    fn best_action(&self, state: &PolicyState) -> usize {
        let values = self.values(state);
        let mut best = 0;
        for (a, v) in values.iter().enumerate().skip(1) {
            if *v > values[best] {
                best = a;
            }
        }
        best
    }
}

/// The persisted value backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum PolicyModel {
    /// Sparse table backend.
    Tabular {
        /// Learned values.
        table: TabularModel,
    },
    /// Neural network backend.
    Parametric {
        /// Weights and optimizer state.
        network: ValueNetwork,
    },
}

impl PolicyModel {
    /// Backend selector for this model.
    pub fn kind(&self) -> BackendKind {
        match self {
            PolicyModel::Tabular { .. } => BackendKind::Tabular,
            PolicyModel::Parametric { .. } => BackendKind::Parametric,
        }
    }
}

impl ValueModel for PolicyModel {
    fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM] {
        match self {
            PolicyModel::Tabular { table } => table.values(state),
            PolicyModel::Parametric { network } => network.values(state),
        }
    }
}
