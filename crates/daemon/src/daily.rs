//! Once-a-day autonomous trigger.

use chrono::{Local, NaiveTime};
use factory_core::api::{TriggerRequest, TriggerResponse};
use factory_core::schedule::next_local_eta;
use tracing::{info, warn};

use crate::service::FactoryService;

/// Time to sleep from `now` until the next `at`.
pub fn until_next(now: chrono::DateTime<Local>, at: NaiveTime) -> std::time::Duration {
    (next_local_eta(&now, at) - now)
        .to_std()
        .unwrap_or_default()
}

/// Sleeps until the next local `at`, then triggers a run with no topic.
pub fn spawn_daily_trigger(svc: FactoryService, at: NaiveTime) {
    tokio::spawn(async move {
        loop {
            let wait = until_next(Local::now(), at);
            info!(at = %at, wait_secs = wait.as_secs(), "next daily run scheduled");
            tokio::time::sleep(wait).await;
            match svc.trigger(TriggerRequest::default()).await {
                Ok(TriggerResponse::Started { run_id, topic }) => {
                    info!(%run_id, %topic, "daily run started")
                }
                Ok(TriggerResponse::Postponed { reason }) => {
                    info!(%reason, "daily run postponed")
                }
                Err(e) => warn!(error = %e, "daily trigger failed"),
            }
        }
    });
}
