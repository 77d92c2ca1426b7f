//! Publication scheduler and dispatcher.
//!
//! Publication work is persisted as typed tasks with an eta and an
//! optional dependency. Workers claim due tasks, execute them through a
//! static match on [`TaskKind`], and complete them together with any
//! follow-up tasks in one store transaction.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone};
use factory_core::model::{
    ActivityStatus, NewTask, PipelineRun, Platform, ScheduledTask, TaskKind, TaskOutcome,
};
use factory_core::now_ms;
use factory_core::policy::PolicyState;
use factory_core::schedule::{after_hours_ms, next_local_eta};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ScheduleConfig;
use crate::context::FactoryContext;
use crate::feedback;
use crate::notify::Notification;
use crate::publish::{PrimaryPost, SecondaryPost};
use crate::storage;
use crate::store::Completion;

/// The finished artifact as carried through the task chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub topic: String,
    pub state: PolicyState,
    pub video_path: PathBuf,
    pub duration_sec: f64,
}

/// Tasks enqueued once the primary upload returned a content id: every
/// configured secondary at its next local clock time, then storage
/// cleanup after the last secondary that still reads the video.
pub fn plan_follow_ups<Tz: TimeZone>(
    schedule: &ScheduleConfig,
    run_id: &str,
    primary_task_id: &str,
    artifact: &Artifact,
    now: &DateTime<Tz>,
) -> Result<Vec<NewTask>> {
    let mut tasks = Vec::new();
    let mut storage_after: Option<(String, i64)> = None;

    for (secondary, at) in schedule.secondary_times()? {
        let eta_ms = next_local_eta(now, at).timestamp_millis();
        let task = NewTask::new(
            run_id,
            TaskKind::PublishSecondary {
                platform: secondary.platform,
                topic: artifact.topic.clone(),
                state: artifact.state,
                video_path: artifact.video_path.clone(),
                duration_sec: artifact.duration_sec,
            },
            eta_ms,
        )
        .after(primary_task_id);
        if secondary.platform.needs_video()
            && storage_after.as_ref().map_or(true, |(_, eta)| eta_ms >= *eta)
        {
            storage_after = Some((task.task_id.clone(), eta_ms));
        }
        tasks.push(task);
    }

    let (dep, eta_ms) =
        storage_after.unwrap_or_else(|| (primary_task_id.to_string(), now.timestamp_millis()));
    tasks.push(
        NewTask::new(
            run_id,
            TaskKind::ManageStorage {
                topic: artifact.topic.clone(),
                video_path: artifact.video_path.clone(),
            },
            eta_ms,
        )
        .after(dep),
    );
    Ok(tasks)
}

/// Analytics fetch for a secondary publication, when enabled for `platform`.
pub fn plan_analytics(
    schedule: &ScheduleConfig,
    task: &ScheduledTask,
    platform: Platform,
    topic: &str,
    state: PolicyState,
    now_ms: i64,
) -> Option<NewTask> {
    let enabled = schedule
        .secondaries
        .iter()
        .any(|s| s.platform == platform && s.collect_analytics);
    enabled.then(|| {
        NewTask::new(
            task.run_id.clone(),
            TaskKind::FetchAnalytics {
                platform,
                topic: topic.to_string(),
                state,
            },
            after_hours_ms(now_ms, schedule.analytics_delay_hours),
        )
        .after(task.task_id.clone())
    })
}

/// Handler result plus the tasks it schedules.
#[derive(Debug)]
pub struct Executed {
    pub outcome: TaskOutcome,
    pub follow_ups: Vec<NewTask>,
}

impl Executed {
    fn ok(result: Option<String>, follow_ups: Vec<NewTask>) -> Self {
        Self {
            outcome: TaskOutcome::Succeeded { result },
            follow_ups,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failed {
                error: error.into(),
            },
            follow_ups: Vec::new(),
        }
    }
}

async fn publish_failed(ctx: &FactoryContext, platform: Platform, topic: &str, error: String) -> Executed {
    error!(%platform, topic, %error, "publish failed");
    ctx.activity
        .record(platform.as_str(), topic, ActivityStatus::Failure, error.clone())
        .await;
    ctx.notify(Notification::PublishFailed {
        platform,
        topic: topic.to_string(),
        error: error.clone(),
    });
    Executed::failed(error)
}

async fn published(ctx: &FactoryContext, platform: Platform, topic: &str, id: &str) {
    info!(%platform, topic, content_id = id, "published");
    ctx.activity
        .record(platform.as_str(), topic, ActivityStatus::Success, format!("content id {id}"))
        .await;
    ctx.notify(Notification::Published {
        platform,
        topic: topic.to_string(),
        content_id: id.to_string(),
    });
}

async fn primary(ctx: &FactoryContext, task: &ScheduledTask, artifact: Artifact, subtitle_paths: &[PathBuf]) -> Executed {
    let platform = Platform::YouTube;
    let post = PrimaryPost::new(
        &artifact.topic,
        artifact.video_path.clone(),
        subtitle_paths.to_vec(),
        &ctx.config.publish.hashtags,
    );
    match ctx.publisher.publish_primary(&post).await {
        Ok(Some(id)) => {
            published(ctx, platform, &artifact.topic, &id).await;
            let now = chrono::Local::now();
            match plan_follow_ups(&ctx.config.schedule, &task.run_id, &task.task_id, &artifact, &now) {
                Ok(follow_ups) => Executed::ok(Some(id), follow_ups),
                Err(e) => Executed::failed(format!("schedule follow-ups: {e:#}")),
            }
        }
        Ok(None) => {
            publish_failed(ctx, platform, &artifact.topic, "platform returned no content id".into()).await
        }
        Err(e) => publish_failed(ctx, platform, &artifact.topic, format!("{e:#}")).await,
    }
}

async fn secondary(ctx: &FactoryContext, task: &ScheduledTask, platform: Platform, artifact: Artifact) -> Executed {
    let Some(primary_id) = task.dependency_result.as_deref() else {
        return Executed::failed("primary content id missing");
    };
    let post = SecondaryPost::new(
        platform,
        &artifact.topic,
        primary_id,
        artifact.video_path.clone(),
        artifact.duration_sec,
        ctx.config.publish.reel_max_duration_sec,
    );
    match ctx.publisher.publish_secondary(platform, &post).await {
        Ok(Some(id)) => {
            published(ctx, platform, &artifact.topic, &id).await;
            let follow_ups = plan_analytics(
                &ctx.config.schedule,
                task,
                platform,
                &artifact.topic,
                artifact.state,
                now_ms(),
            )
            .into_iter()
            .collect();
            Executed::ok(Some(id), follow_ups)
        }
        Ok(None) => {
            info!(%platform, topic = %artifact.topic, "published without content id");
            ctx.activity
                .record(platform.as_str(), &artifact.topic, ActivityStatus::Success, "no content id")
                .await;
            Executed::ok(None, Vec::new())
        }
        Err(e) => publish_failed(ctx, platform, &artifact.topic, format!("{e:#}")).await,
    }
}

async fn analytics(ctx: &FactoryContext, task: &ScheduledTask, platform: Platform, topic: &str, state: PolicyState) -> Executed {
    let Some(content_id) = task.dependency_result.as_deref() else {
        return Executed::failed("publication content id missing");
    };
    match feedback::collect(ctx, platform, topic, state, content_id).await {
        Ok(record) => Executed::ok(
            Some(format!("{:.2}", record.engagement_rate)),
            Vec::new(),
        ),
        Err(e) => Executed::failed(format!("{e:#}")),
    }
}

async fn cleanup(ctx: &FactoryContext, topic: &str, video_path: &Path) -> Executed {
    match storage::manage_storage(&ctx.data_dir, topic, video_path).await {
        Ok(report) => Executed::ok(
            report.backup_path.map(|p| p.display().to_string()),
            Vec::new(),
        ),
        Err(e) => {
            error!(topic, error = %format!("{e:#}"), "storage management failed");
            Executed::failed(format!("{e:#}"))
        }
    }
}

/// Runs one claimed task. Never fails: handler errors become
/// [`TaskOutcome::Failed`].
pub async fn execute(ctx: &FactoryContext, task: &ScheduledTask) -> Executed {
    match &task.kind {
        TaskKind::PublishPrimary {
            topic,
            state,
            video_path,
            subtitle_paths,
            duration_sec,
        } => {
            let artifact = Artifact {
                topic: topic.clone(),
                state: *state,
                video_path: video_path.clone(),
                duration_sec: *duration_sec,
            };
            primary(ctx, task, artifact, subtitle_paths).await
        }
        TaskKind::PublishSecondary {
            platform,
            topic,
            state,
            video_path,
            duration_sec,
        } => {
            let artifact = Artifact {
                topic: topic.clone(),
                state: *state,
                video_path: video_path.clone(),
                duration_sec: *duration_sec,
            };
            secondary(ctx, task, *platform, artifact).await
        }
        TaskKind::FetchAnalytics {
            platform,
            topic,
            state,
        } => analytics(ctx, task, *platform, topic, *state).await,
        TaskKind::ManageStorage { topic, video_path } => cleanup(ctx, topic, video_path).await,
    }
}

/// Drives `work` while pushing the task's lease forward every third of
/// its length, so a slow handler is never requeued under a live worker.
async fn with_lease_heartbeat<F: Future>(
    ctx: &FactoryContext,
    task_id: &str,
    token: &str,
    work: F,
) -> F::Output {
    let lease_ms = ctx.lease_ms();
    let mut beat = interval(Duration::from_millis((lease_ms / 3).max(1) as u64));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    beat.tick().await;
    tokio::pin!(work);
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = beat.tick() => match ctx.store.renew_lease(task_id, token, now_ms(), lease_ms) {
                Ok(true) => {}
                Ok(false) => warn!(task_id, "lease lost while running"),
                Err(e) => warn!(task_id, error = %e, "lease renewal failed"),
            },
        }
    }
}

/// Executes a leased task and records its outcome with its follow-ups.
/// The lease is renewed for as long as the handler runs.
pub async fn run_task(ctx: &FactoryContext, task: ScheduledTask) -> Result<TaskOutcome> {
    let token = task
        .lease_token
        .clone()
        .ok_or_else(|| anyhow!("task {} has no lease", task.task_id))?;
    let span = info_span!("task", task_id = %task.task_id, kind = %task.kind.label(), attempt = task.attempts);
    let Executed {
        outcome,
        follow_ups,
    } = with_lease_heartbeat(ctx, &task.task_id, &token, execute(ctx, &task))
        .instrument(span)
        .await;

    match ctx
        .store
        .complete(&task.task_id, &token, &outcome, &follow_ups, now_ms())?
    {
        Completion::Recorded { skipped } => {
            if !skipped.is_empty() {
                warn!(task_id = %task.task_id, skipped = skipped.len(), "dependents skipped");
            }
            if !follow_ups.is_empty() {
                info!(task_id = %task.task_id, scheduled = follow_ups.len(), "follow-up tasks scheduled");
            }
        }
        Completion::AlreadyTerminal => {
            warn!(task_id = %task.task_id, "task completed elsewhere; outcome dropped");
        }
    }
    Ok(outcome)
}

/// Submits the primary publication for a finished run and runs it now.
pub async fn publish_run(ctx: &FactoryContext, run: &PipelineRun) -> Result<TaskOutcome> {
    let video_path = run
        .video_path()
        .cloned()
        .ok_or_else(|| anyhow!("run {} has no assembled video", run.run_id))?;
    let subtitle_paths = run
        .stage_outputs
        .get(&factory_core::model::StageName::Subtitles)
        .cloned()
        .unwrap_or_default();
    let now = now_ms();
    let task = NewTask::new(
        run.run_id.clone(),
        TaskKind::PublishPrimary {
            topic: run.topic.clone(),
            state: run.state,
            video_path,
            subtitle_paths,
            duration_sec: run.duration_sec.unwrap_or_default(),
        },
        now,
    );
    ctx.store.enqueue(&task, now)?;
    let worker = format!("run:{}", run.run_id);
    let claimed = ctx
        .store
        .claim_task(&task.task_id, &worker, now, ctx.lease_ms())?
        .ok_or_else(|| anyhow!("primary task {} was claimed elsewhere", task.task_id))?;
    run_task(ctx, claimed).await
}

/// Requeues expired leases, then drains every due task.
pub async fn tick(ctx: &FactoryContext, worker: &str) -> Result<usize> {
    let requeued = ctx.store.requeue_expired(now_ms())?;
    if requeued > 0 {
        warn!(worker, requeued, "expired leases requeued");
    }
    let mut done = 0;
    while let Some(task) = ctx.store.claim_due(worker, now_ms(), ctx.lease_ms())? {
        run_task(ctx, task).await?;
        done += 1;
    }
    Ok(done)
}

/// Starts `workers` dispatcher loops.
pub fn spawn_dispatcher(ctx: Arc<FactoryContext>, workers: usize) {
    let every = Duration::from_millis(ctx.config.schedule.dispatch_interval_ms.max(100));
    for n in 0..workers.max(1) {
        let ctx = Arc::clone(&ctx);
        let worker = format!("worker-{n}");
        tokio::spawn(async move {
            let mut tick_every = interval(every);
            loop {
                tick_every.tick().await;
                if let Err(e) = tick(&ctx, &worker).await {
                    warn!(worker = %worker, error = %e, "dispatch tick failed");
                }
            }
        });
    }
}
