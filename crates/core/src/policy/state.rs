use serde::{Deserialize, Serialize};

use crate::model::{LengthCategory, TopicCategory};

/// Topic segment of the state vector.
pub const TOPIC_CATEGORIES: [TopicCategory; 4] = TopicCategory::ALL;

/// Length segment of the state vector.
pub const LENGTH_CATEGORIES: [LengthCategory; 2] = LengthCategory::ALL;

/// Width of the encoded state.
pub const STATE_DIM: usize = TOPIC_CATEGORIES.len() + LENGTH_CATEGORIES.len();

/// The closed action set. Changing it invalidates every persisted model.
pub const POSSIBLE_TOPICS: [&str; 6] = [
    "MikroTik Firewall Rules",
    "MikroTik VPN Setup",
    "MikroTik OSPF Routing",
    "MikroTik Basic Setup",
    "MikroTik VLANs",
    "MikroTik QoS",
];

/// Number of actions.
pub const ACTION_DIM: usize = POSSIBLE_TOPICS.len();

/// Decision context: one topic category and one length category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyState {
    /// Topic category bit.
    pub category: TopicCategory,
    /// Length category bit.
    pub length: LengthCategory,
}

impl PolicyState {
    /// Builds a state.
    pub fn new(category: TopicCategory, length: LengthCategory) -> Self {
        Self { category, length }
    }

    /// One-hot encoding: topic bit at `category`, length bit at
    /// `TOPIC_CATEGORIES.len() + length`.
    pub fn encode(&self) -> [f32; STATE_DIM] {
        let mut v = [0.0; STATE_DIM];
        v[self.category.index()] = 1.0;
        v[TOPIC_CATEGORIES.len() + self.length.index()] = 1.0;
        v
    }
}

impl Default for PolicyState {
    fn default() -> Self {
        Self::new(TopicCategory::General, LengthCategory::Short)
    }
}

/// Action index for a topic, if it belongs to the action set. Matching
/// ignores ASCII case and surrounding whitespace.
pub fn action_for_topic(topic: &str) -> Option<usize> {
    let topic = topic.trim();
    POSSIBLE_TOPICS.iter().position(|t| t.eq_ignore_ascii_case(topic))
}

/// Topic name for an action index.
pub fn topic_for_action(action: usize) -> Option<&'static str> {
    POSSIBLE_TOPICS.get(action).copied()
}
