//! Engagement scoring.

use crate::model::EngagementMetrics;

/// Scalar reward: `ctr*100 + watch_time/10 + sentiment*20`.
pub fn reward(m: &EngagementMetrics) -> f64 {
    m.ctr * 100.0 + m.avg_watch_time_sec / 10.0 + m.sentiment * 20.0
}

/// `(likes + comments) / views * 100`, rounded to two decimals; zero without views.
pub fn engagement_rate(m: &EngagementMetrics) -> f64 {
    if m.views == 0 {
        return 0.0;
    }
    let rate = (m.likes + m.comments) as f64 / m.views as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_weights() {
        let m = EngagementMetrics {
            ctr: 0.12,
            avg_watch_time_sec: 240.0,
            sentiment: -0.5,
            ..Default::default()
        };
        assert!((reward(&m) - (12.0 + 24.0 - 10.0)).abs() < 1e-9);
    }

    #[test]
    fn engagement_rate_rounds_and_handles_zero_views() {
        let m = EngagementMetrics {
            views: 3000,
            likes: 90,
            comments: 7,
            ..Default::default()
        };
        assert_eq!(engagement_rate(&m), 3.23);
        assert_eq!(engagement_rate(&EngagementMetrics::default()), 0.0);
    }
}
