#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Content factory daemon: owns the durable schedule and runs the pipeline.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use factory_core::model::ActivityStatus;
use factory_daemon::{
    activity::ActivityLog,
    config::FactoryConfig,
    context::{resolve, FactoryContext},
    daily, http, scheduler, secrets,
    service::FactoryService,
    storage,
    store::SqliteStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "factory-daemon")]
struct Args {
    /// Data directory for the schedule, logs, model, and media.
    #[arg(long, default_value = ".factory")]
    data_dir: PathBuf,

    /// Config file; defaults to `<data-dir>/factory.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,

    /// Disable the daily autonomous trigger.
    #[arg(long)]
    no_daily: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("create {}", args.data_dir.display()))?;
    let data_dir = std::fs::canonicalize(&args.data_dir).unwrap_or_else(|_| args.data_dir.clone());

    let config_path = args
        .config
        .clone()
        .map(|p| resolve(&data_dir, &p))
        .unwrap_or_else(|| FactoryConfig::config_path(&data_dir));
    let mut config = FactoryConfig::load_or_init(&config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    // Nothing else starts until credentials are in hand.
    let activity = ActivityLog::new(data_dir.join("activity.log"));
    let bundle = match secrets::load(&config.secrets, &data_dir) {
        Ok(b) => b,
        Err(e) => {
            activity
                .record("secrets", "", ActivityStatus::Failure, e.to_string())
                .await;
            return Err(e).context("load secrets");
        }
    };
    activity
        .record(
            "secrets",
            "",
            ActivityStatus::Success,
            format!("{} credentials loaded", bundle.len()),
        )
        .await;

    let store = SqliteStore::open(&FactoryConfig::db_path(&data_dir))?;
    let ctx = Arc::new(FactoryContext::from_config(
        config.clone(),
        data_dir.clone(),
        Arc::new(bundle),
        Arc::new(store),
    )?);
    let svc = FactoryService::new(Arc::clone(&ctx));

    scheduler::spawn_dispatcher(Arc::clone(&ctx), config.schedule.workers);
    storage::spawn_gc(
        Arc::new(data_dir.clone()),
        config.storage.backup_retention_days,
        Duration::from_secs(config.storage.gc_interval_seconds),
    );
    match config.schedule.daily_time()? {
        Some(at) if !args.no_daily => daily::spawn_daily_trigger(svc.clone(), at),
        _ => tracing::info!("daily trigger disabled"),
    }

    let app = http::router(svc);

    tracing::info!(listen = %config.listen, data_dir = %data_dir.display(), "daemon starting");
    axum::serve(tokio::net::TcpListener::bind(config.listen).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
