//! Run admission and lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use factory_core::api::{BackupEntry, StatusResponse, TriggerRequest, TriggerResponse};
use factory_core::model::{
    ActivityLogEntry, ActivityStatus, PipelineRun, RunStatus, TaskOutcome, TopicCategory,
};
use factory_core::policy::PolicyState;
use factory_core::{new_ulid, now_ms};
use tracing::{error, info, warn, Instrument};

use crate::context::FactoryContext;
use crate::notify::Notification;
use crate::pipeline;
use crate::scheduler;
use crate::storage;

/// Result of the admission step.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Started(PipelineRun),
    /// The gate denied entry; nothing was recorded.
    Postponed { reason: String },
}

/// Main service: admission, production, and read-side queries.
#[derive(Clone)]
pub struct FactoryService {
    ctx: Arc<FactoryContext>,
}

impl FactoryService {
    pub fn new(ctx: Arc<FactoryContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<FactoryContext> {
        &self.ctx
    }

    /// Category of the most recently started run, General when there is none.
    fn last_category(&self) -> Result<TopicCategory> {
        Ok(self
            .ctx
            .store
            .recent_runs(1)?
            .first()
            .map(|r| TopicCategory::for_topic(&r.topic))
            .unwrap_or(TopicCategory::General))
    }

    /// Checks the gate, picks a topic, and records a pending run.
    pub async fn admit(&self, req: TriggerRequest) -> Result<Admission> {
        if let Err(reason) = self.ctx.gate.check().await {
            return Ok(Admission::Postponed { reason });
        }

        let length = req.length_category.unwrap_or_default();
        let state = PolicyState::new(self.last_category()?, length);
        let topic = match req.topic.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
            Some(topic) => {
                info!(%topic, "manual topic requested");
                topic
            }
            None => {
                let trending = match self.ctx.trends.trending().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "trending topics unavailable");
                        Vec::new()
                    }
                };
                let pick = self.ctx.policy.select(state, &trending).await;
                info!(
                    topic = %pick.topic,
                    action = ?pick.action,
                    explored = pick.explored,
                    trend_override = pick.trend_override,
                    "policy selected topic"
                );
                pick.topic
            }
        };

        let now = now_ms();
        let run = PipelineRun {
            run_id: new_ulid().to_string(),
            topic,
            length_category: length,
            estimated_duration_sec: length.estimated_duration_sec(),
            state,
            stage_outputs: Default::default(),
            status: RunStatus::Pending,
            duration_sec: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.ctx.store.insert_run(&run).context("record run")?;
        Ok(Admission::Started(run))
    }

    /// Admits a run and produces it in the background.
    pub async fn trigger(&self, req: TriggerRequest) -> Result<TriggerResponse> {
        match self.admit(req).await? {
            Admission::Postponed { reason } => Ok(TriggerResponse::Postponed { reason }),
            Admission::Started(run) => {
                let resp = TriggerResponse::Started {
                    run_id: run.run_id.clone(),
                    topic: run.topic.clone(),
                };
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    execute_run(&ctx, run).await;
                });
                Ok(resp)
            }
        }
    }

    /// Admits a run and produces it before returning.
    pub async fn run_now(&self, req: TriggerRequest) -> Result<Admission> {
        Ok(match self.admit(req).await? {
            Admission::Started(run) => Admission::Started(execute_run(&self.ctx, run).await),
            postponed => postponed,
        })
    }

    pub fn status(&self) -> Result<StatusResponse> {
        let recent_runs = self.ctx.store.recent_runs(20)?;
        let active_runs = self
            .ctx
            .store
            .recent_runs(100)?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        Ok(StatusResponse {
            active_runs,
            recent_runs,
            queue: self.ctx.store.open_tasks()?,
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        self.ctx.store.get_run(run_id)
    }

    /// Last `limit` activity entries, oldest first.
    pub async fn activity(&self, limit: usize) -> Result<Vec<ActivityLogEntry>> {
        self.ctx.activity.tail(limit).await
    }

    pub async fn backups(&self) -> Result<Vec<BackupEntry>> {
        let data_dir = self.ctx.data_dir.clone();
        tokio::task::spawn_blocking(move || storage::list_backups(&data_dir))
            .await
            .context("list backups task")?
    }

    /// Removes a deferred task that has not started yet.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let removed = self.ctx.store.cancel(task_id)?;
        if removed {
            info!(task_id, "deferred task removed");
        }
        Ok(removed)
    }
}

fn finish(ctx: &FactoryContext, run: &mut PipelineRun, status: RunStatus, error: Option<String>) {
    run.status = status;
    run.error = error;
    run.updated_at_ms = now_ms();
    if let Err(e) = ctx.store.update_run(run) {
        error!(run_id = %run.run_id, error = %e, "persist run failed");
    }
}

/// Produces and publishes one admitted run. Every path ends with the run
/// Succeeded or Failed; errors never escape to the caller.
pub async fn execute_run(ctx: &FactoryContext, mut run: PipelineRun) -> PipelineRun {
    let span = tracing::info_span!("run", run_id = %run.run_id, topic = %run.topic);
    async {
        info!("production started");
        if let Err(failure) = pipeline::produce(ctx, &mut run).await {
            let reason = format!("{} stage failed: {}", failure.stage, failure.message);
            finish(ctx, &mut run, RunStatus::Failed, Some(reason.clone()));
            ctx.activity
                .record("pipeline", &run.topic, ActivityStatus::Failure, reason)
                .await;
            ctx.notify(Notification::StageFailure {
                run_id: run.run_id.clone(),
                topic: run.topic.clone(),
                stage: failure.stage,
                message: failure.message,
                diagnostic: failure.diagnostic,
            });
            return;
        }

        match scheduler::publish_run(ctx, &run).await {
            Ok(TaskOutcome::Succeeded { .. }) => {
                info!("run produced and handed to the scheduler");
                finish(ctx, &mut run, RunStatus::Succeeded, None);
            }
            Ok(TaskOutcome::Failed { error }) => {
                finish(ctx, &mut run, RunStatus::Failed, Some(format!("primary publish failed: {error}")));
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "handoff to scheduler failed");
                finish(ctx, &mut run, RunStatus::Failed, Some(format!("{e:#}")));
            }
        }
    }
    .instrument(span)
    .await;
    run
}
