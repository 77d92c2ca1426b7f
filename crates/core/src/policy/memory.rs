use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::PolicyState;

/// One (state, action, reward) sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    /// State the action was taken in.
    pub state: PolicyState,
    /// Index into `POSSIBLE_TOPICS`.
    pub action: usize,
    /// Observed reward.
    pub reward: f64,
}

/// Fixed-capacity ring buffer of transitions.
///
/// Once full, each push overwrites the oldest entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayMemory {
    capacity: usize,
    entries: Vec<Transition>,
    position: usize,
}

impl ReplayMemory {
    /// Empty buffer holding at most `capacity` transitions (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Vec::with_capacity(capacity.min(1024)),
            position: 0,
        }
    }

    /// Appends, overwriting the oldest entry once full.
    pub fn push(&mut self, transition: Transition) {
        if self.entries.len() < self.capacity {
            self.entries.push(transition);
        } else {
            self.entries[self.position] = transition;
        }
        self.position = (self.position + 1) % self.capacity;
    }

    /// Uniform sample of `n` distinct entries, or `None` if fewer are held.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Option<Vec<Transition>> {
        if n == 0 || self.entries.len() < n {
            return None;
        }
        Some(self.entries.choose_multiple(rng, n).copied().collect())
    }

    /// Held entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum held entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in storage order (not insertion order once wrapped).
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn t(reward: f64) -> Transition {
        Transition {
            state: PolicyState::default(),
            action: 0,
            reward,
        }
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut m = ReplayMemory::new(3);
        for r in 0..5 {
            m.push(t(r as f64));
        }
        assert_eq!(m.len(), 3);
        let mut rewards: Vec<f64> = m.iter().map(|t| t.reward).collect();
        rewards.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rewards, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn sample_requires_full_batch() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut m = ReplayMemory::new(10);
        m.push(t(1.0));
        m.push(t(2.0));
        assert!(m.sample(3, &mut rng).is_none());
        m.push(t(3.0));
        let batch = m.sample(3, &mut rng).unwrap();
        let mut rewards: Vec<f64> = batch.iter().map(|t| t.reward).collect();
        rewards.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rewards, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut m = ReplayMemory::new(0);
        m.push(t(1.0));
        m.push(t(2.0));
        assert_eq!(m.capacity(), 1);
        assert_eq!(m.iter().next().map(|t| t.reward), Some(2.0));
    }
}
