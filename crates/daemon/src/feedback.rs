//! Delayed engagement fetch feeding reward back into the policy.

use anyhow::{Context, Result};
use factory_core::feedback::engagement_rate;
use factory_core::model::{ActivityStatus, PerformanceRecord, Platform, TopicCategory};
use factory_core::policy::{LearnOutcome, PolicyState};
use tracing::{info, warn};

use crate::activity::local_timestamp;
use crate::context::FactoryContext;

fn activity_platform(platform: Platform) -> String {
    format!("{platform}:analytics")
}

/// Fetches metrics for `content_id`, updates the policy, and upserts the
/// performance record. A missing or deleted publication fails the task.
pub async fn collect(
    ctx: &FactoryContext,
    platform: Platform,
    topic: &str,
    state: PolicyState,
    content_id: &str,
) -> Result<PerformanceRecord> {
    let label = activity_platform(platform);
    let metrics = match ctx.publisher.fetch_engagement(platform, content_id).await {
        Ok(m) => m,
        Err(e) => {
            warn!(%platform, content_id, error = %e, "engagement fetch failed");
            ctx.activity
                .record(&label, topic, ActivityStatus::Failure, format!("{content_id}: {e:#}"))
                .await;
            return Err(e.context(format!("fetch engagement for {content_id}")));
        }
    };

    let outcome = ctx
        .policy
        .learn(state, topic, &metrics)
        .await
        .context("policy update")?;
    match &outcome {
        LearnOutcome::Skipped { .. } => {}
        LearnOutcome::Updated { reward, value } => {
            info!(topic, reward, ?value, "policy updated from engagement")
        }
    }

    let record = PerformanceRecord {
        timestamp: local_timestamp(),
        media_id: content_id.to_string(),
        topic: topic.to_string(),
        category: TopicCategory::for_topic(topic),
        length: state.length,
        views: metrics.views,
        likes: metrics.likes,
        comments: metrics.comments,
        engagement_rate: engagement_rate(&metrics),
        ctr: metrics.ctr,
        watch_time: metrics.avg_watch_time_sec,
        sentiment: metrics.sentiment,
        reward: outcome.reward(),
    };
    ctx.performance
        .upsert(record.clone())
        .await
        .context("write performance log")?;

    let details = match record.reward {
        Some(r) => format!("{content_id}: engagement {:.2}%, reward {r:.2}", record.engagement_rate),
        None => format!("{content_id}: engagement {:.2}%, not in action set", record.engagement_rate),
    };
    ctx.activity
        .record(&label, topic, ActivityStatus::Success, details)
        .await;
    Ok(record)
}
