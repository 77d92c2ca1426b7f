use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::{action_for_topic, topic_for_action, ACTION_DIM, POSSIBLE_TOPICS};
use super::{PolicyState, Transition, ValueModel};

/// Sparse Q-table keyed by (state, action). Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "TableFile", try_from = "TableFile")]
pub struct TabularModel {
    table: BTreeMap<(PolicyState, usize), f64>,
}

impl TabularModel {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored value, or zero.
    pub fn get(&self, state: &PolicyState, action: usize) -> f64 {
        self.table.get(&(*state, action)).copied().unwrap_or(0.0)
    }

    /// `Q(s,a) <- Q(s,a) + alpha * (r - Q(s,a))`. Next-state value is zero.
    pub fn update(&mut self, transition: &Transition, alpha: f64) -> f64 {
        let key = (transition.state, transition.action);
        let old = self.table.get(&key).copied().unwrap_or(0.0);
        let new = old + alpha * (transition.reward - old);
        self.table.insert(key, new);
        new
    }

    /// Stored entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True before the first update.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl ValueModel for TabularModel {
    fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM] {
        let mut out = [0.0; ACTION_DIM];
        for (a, v) in out.iter_mut().enumerate() {
            *v = self.get(state, a);
        }
        out
    }
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    entries: Vec<TableEntry>,
}

#[derive(Serialize, Deserialize)]
struct TableEntry {
    state: PolicyState,
    action: String,
    value: f64,
}

impl From<TabularModel> for TableFile {
    fn from(m: TabularModel) -> Self {
        let entries = m
            .table
            .into_iter()
            .filter_map(|((state, action), value)| {
                topic_for_action(action).map(|t| TableEntry {
                    state,
                    action: t.to_string(),
                    value,
                })
            })
            .collect();
        Self { entries }
    }
}

impl TryFrom<TableFile> for TabularModel {
    type Error = String;

    fn try_from(f: TableFile) -> Result<Self, Self::Error> {
        let mut table = BTreeMap::new();
        for e in f.entries {
            let action = action_for_topic(&e.action).ok_or_else(|| {
                format!(
                    "model references topic '{}' outside the action set {:?}",
                    e.action, POSSIBLE_TOPICS
                )
            })?;
            table.insert((e.state, action), e.value);
        }
        Ok(Self { table })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LengthCategory, TopicCategory};

    #[test]
    fn repeated_reward_converges() {
        let mut m = TabularModel::new();
        let t = Transition {
            state: PolicyState::new(TopicCategory::Vpn, LengthCategory::Short),
            action: 1,
            reward: 42.0,
        };
        let mut prev_gap = f64::MAX;
        for _ in 0..200 {
            let v = m.update(&t, 0.1);
            let gap = (42.0 - v).abs();
            assert!(gap <= prev_gap);
            prev_gap = gap;
        }
        assert!(prev_gap < 1e-6);
    }

    #[test]
    fn zero_reward_at_fixed_point_is_idempotent() {
        let mut m = TabularModel::new();
        let t = Transition {
            state: PolicyState::default(),
            action: 0,
            reward: 0.0,
        };
        for _ in 0..5 {
            assert_eq!(m.update(&t, 0.1), 0.0);
        }
    }

    #[test]
    fn serializes_actions_by_topic_name() {
        let mut m = TabularModel::new();
        m.update(
            &Transition {
                state: PolicyState::default(),
                action: 4,
                reward: 10.0,
            },
            0.5,
        );
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("MikroTik VLANs"));
        let back: TabularModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn rejects_unknown_action() {
        let json = r#"{"entries":[{"state":{"category":"General","length":"Short"},"action":"MikroTik BGP","value":1.0}]}"#;
        let err = serde_json::from_str::<TabularModel>(json).unwrap_err();
        assert!(err.to_string().contains("outside the action set"));
    }
}
