//! Strictly ordered production stages for one run.
//!
//! The first failing stage aborts the run. Retrying is the stage
//! collaborator's job; nothing here repeats a stage.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::future::Future;
use std::path::PathBuf;

use factory_core::model::{PipelineRun, RunStatus, StageName};
use factory_core::now_ms;
use tracing::{error, info, info_span, Instrument};

use crate::context::FactoryContext;

/// A stage error captured for the notifier.
#[derive(Clone, Debug, PartialEq)]
pub struct StageFailure {
    pub stage: StageName,
    /// The error chain on one line.
    pub message: String,
    /// Full debug rendering, including the backtrace when captured.
    pub diagnostic: String,
}

impl StageFailure {
    /// Always carries a stack trace: the error's own when one was
    /// captured, otherwise one taken here.
    pub fn new(stage: StageName, err: &anyhow::Error) -> Self {
        let mut diagnostic = format!("{err:?}");
        if err.backtrace().status() != BacktraceStatus::Captured {
            diagnostic.push_str(&format!(
                "\n\nStack backtrace:\n{}",
                Backtrace::force_capture()
            ));
        }
        Self {
            stage,
            message: format!("{err:#}"),
            diagnostic,
        }
    }
}

/// Stores the run; a store error is logged and production continues.
fn persist(ctx: &FactoryContext, run: &mut PipelineRun) {
    run.updated_at_ms = now_ms();
    if let Err(e) = ctx.store.update_run(run) {
        error!(run_id = %run.run_id, error = %e, "persist run failed");
    }
}

async fn step<T, F>(stage: StageName, run: &PipelineRun, fut: F) -> Result<T, StageFailure>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let span = info_span!("stage", run_id = %run.run_id, %stage);
    match fut.instrument(span).await {
        Ok(v) => Ok(v),
        Err(e) => {
            error!(run_id = %run.run_id, %stage, error = %format!("{e:#}"), "stage failed");
            Err(StageFailure::new(stage, &e))
        }
    }
}

fn record(ctx: &FactoryContext, run: &mut PipelineRun, stage: StageName, paths: Vec<PathBuf>) {
    info!(run_id = %run.run_id, %stage, outputs = paths.len(), "stage done");
    run.stage_outputs.insert(stage, paths);
    persist(ctx, run);
}

/// Runs Script → Voice → Visuals → Subtitles → Assembly, recording each
/// stage's outputs on `run`. On success the run carries the final video
/// and its duration; the caller hands it to the scheduler.
pub async fn produce(ctx: &FactoryContext, run: &mut PipelineRun) -> Result<(), StageFailure> {
    run.status = RunStatus::Running;
    persist(ctx, run);
    let topic = run.topic.clone();
    let stages = &ctx.stages;

    let script = step(
        StageName::Script,
        run,
        stages.script(&topic, run.estimated_duration_sec),
    )
    .await?;
    record(ctx, run, StageName::Script, vec![script.clone()]);

    let audio = step(StageName::Voice, run, stages.voice(&topic, &script)).await?;
    record(ctx, run, StageName::Voice, vec![audio.clone()]);

    let visuals = step(StageName::Visuals, run, stages.visuals(&topic)).await?;
    record(ctx, run, StageName::Visuals, visuals.clone());

    let subtitles = step(StageName::Subtitles, run, stages.subtitles(&topic, &audio)).await?;
    record(ctx, run, StageName::Subtitles, subtitles.clone());

    let video = step(
        StageName::Assembly,
        run,
        stages.assemble(&topic, &visuals, &audio, subtitles.first().map(PathBuf::as_path)),
    )
    .await?;
    run.duration_sec = Some(video.duration_sec);
    record(ctx, run, StageName::Assembly, vec![video.path]);
    Ok(())
}
