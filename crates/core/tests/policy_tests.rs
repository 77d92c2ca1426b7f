//! Selection and learning behaviour of the policy agent.

use factory_core::model::{EngagementMetrics, LengthCategory, TopicCategory};
use factory_core::policy::{
    BackendKind, LearnOutcome, PolicyAgent, PolicyConfig, PolicyState, ACTION_DIM,
    POSSIBLE_TOPICS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn config(epsilon: f64) -> PolicyConfig {
    PolicyConfig {
        epsilon,
        ..PolicyConfig::default()
    }
}

fn metrics(ctr: f64, watch: f64, sentiment: f64) -> EngagementMetrics {
    EngagementMetrics {
        views: 1000,
        likes: 50,
        comments: 5,
        ctr,
        avg_watch_time_sec: watch,
        sentiment,
    }
}

#[test]
fn greedy_selection_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(10);
    let mut agent = PolicyAgent::new(config(0.0), &mut rng);
    let state = PolicyState::new(TopicCategory::Vpn, LengthCategory::Short);
    agent.learn(state, "MikroTik OSPF Routing", &metrics(0.1, 100.0, 0.2), &mut rng);

    let first = agent.select(state, &[], &mut rng);
    assert_eq!(first.topic, "MikroTik OSPF Routing");
    assert!(!first.explored);
    for _ in 0..100 {
        let again = agent.select(state, &[], &mut rng);
        assert_eq!(again.topic, first.topic);
        assert_eq!(again.action, first.action);
    }
}

#[test]
fn untrained_greedy_prefers_lowest_index() {
    let mut rng = StdRng::seed_from_u64(11);
    let agent = PolicyAgent::new(config(0.0), &mut rng);
    let s = agent.select(PolicyState::default(), &[], &mut rng);
    assert_eq!(s.action, Some(0));
    assert_eq!(s.topic, POSSIBLE_TOPICS[0]);
}

#[test]
fn full_exploration_is_uniform() {
    let mut rng = StdRng::seed_from_u64(12);
    let agent = PolicyAgent::new(config(1.0), &mut rng);
    let trials = 60_000;
    let mut counts = [0usize; ACTION_DIM];
    for _ in 0..trials {
        let s = agent.select(PolicyState::default(), &[], &mut rng);
        assert!(s.explored);
        counts[s.action.unwrap()] += 1;
    }
    let expected = trials as f64 / ACTION_DIM as f64;
    let chi2: f64 = counts
        .iter()
        .map(|&c| (c as f64 - expected).powi(2) / expected)
        .sum();
    // 5 degrees of freedom; p = 0.001 critical value is 20.52.
    assert!(chi2 < 20.52, "counts {counts:?}, chi2 {chi2}");
}

#[test]
fn trending_override_applies_about_half_the_time() {
    let mut rng = StdRng::seed_from_u64(13);
    let agent = PolicyAgent::new(config(0.0), &mut rng);
    let trending = vec!["MikroTik setup".to_string()];
    let trials = 10_000;
    let mut overridden = 0;
    for _ in 0..trials {
        let s = agent.select(PolicyState::default(), &trending, &mut rng);
        if s.trend_override {
            overridden += 1;
            assert_eq!(s.topic, "MikroTik setup");
            assert_eq!(s.action, None);
        } else {
            assert_eq!(s.topic, POSSIBLE_TOPICS[0]);
        }
    }
    let share = overridden as f64 / trials as f64;
    assert!((share - 0.5).abs() < 0.03, "override share {share}");
}

#[test]
fn trending_pick_is_never_overridden() {
    let mut rng = StdRng::seed_from_u64(14);
    let agent = PolicyAgent::new(config(0.0), &mut rng);
    let trending = vec![POSSIBLE_TOPICS[0].to_lowercase(), "MikroTik setup".to_string()];
    for _ in 0..500 {
        let s = agent.select(PolicyState::default(), &trending, &mut rng);
        assert!(!s.trend_override);
        assert_eq!(s.topic, POSSIBLE_TOPICS[0]);
    }
}

#[test]
fn selection_carries_length_and_duration() {
    let mut rng = StdRng::seed_from_u64(15);
    let agent = PolicyAgent::new(config(0.0), &mut rng);
    let s = agent.select(
        PolicyState::new(TopicCategory::General, LengthCategory::Long),
        &[],
        &mut rng,
    );
    assert_eq!(s.length_category, LengthCategory::Long);
    assert_eq!(s.estimated_duration_sec, 600);
}

#[test]
fn repeated_transitions_converge_tabular_value() {
    let mut rng = StdRng::seed_from_u64(16);
    let mut agent = PolicyAgent::new(config(0.0), &mut rng);
    let state = PolicyState::new(TopicCategory::Firewall, LengthCategory::Long);
    let m = metrics(0.08, 120.0, 0.25); // reward 8 + 12 + 5 = 25
    let mut last = 0.0;
    for _ in 0..150 {
        match agent.learn(state, "MikroTik Firewall Rules", &m, &mut rng) {
            LearnOutcome::Updated { value: Some(v), .. } => {
                assert!(v >= last);
                last = v;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!((last - 25.0).abs() < 1e-3, "value {last}");
}

#[test]
fn parametric_backend_learns_preference() {
    let mut rng = StdRng::seed_from_u64(17);
    let cfg = PolicyConfig {
        backend: BackendKind::Parametric,
        epsilon: 0.0,
        batch_size: 16,
        hidden_units: 32,
        nn_learning_rate: 1e-2,
        ..PolicyConfig::default()
    };
    let mut agent = PolicyAgent::new(cfg, &mut rng);
    let state = PolicyState::new(TopicCategory::Routing, LengthCategory::Short);
    for _ in 0..400 {
        agent.learn(state, "MikroTik VLANs", &metrics(0.1, 100.0, 0.5), &mut rng);
        agent.learn(state, "MikroTik QoS", &metrics(0.0, 0.0, -0.5), &mut rng);
    }
    let values = agent.values(&state);
    assert!(values[4] > values[5] + 5.0, "{values:?}");
}
