use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use factory_core::api::{
    ActivityResponse, BackupsResponse, CancelResponse, StatusResponse, TriggerRequest,
    TriggerResponse,
};
use factory_core::model::{LengthCategory, PipelineRun};
use factory_daemon::secrets::{self, SecretBundle};

#[derive(Parser, Debug)]
#[command(name = "factoryctl")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start a run; without --topic the policy picks one.
    Trigger {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        length: Option<LengthCategory>,
    },
    Run {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
        #[arg(long)]
        run_id: String,
    },
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
    },
    Activity {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    Backups {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
    },
    /// Remove a deferred task that has not started.
    Cancel {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        daemon: String,
        task_id: String,
    },
    /// Encrypt a plaintext KEY=VALUE file with the master password.
    Seal {
        #[arg(long, default_value = ".env")]
        input: PathBuf,
        #[arg(long, default_value = ".env.encrypted")]
        output: PathBuf,
        #[arg(long, default_value = "SECRET_MASTER_PASSWORD")]
        password_env: String,
    },
    /// Decrypt a sealed bundle. With --check only the credential names are printed.
    Unseal {
        #[arg(long, default_value = ".env.encrypted")]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "SECRET_MASTER_PASSWORD")]
        password_env: String,
        #[arg(long)]
        check: bool,
    },
}

fn password(env: &str) -> anyhow::Result<String> {
    std::env::var(env)
        .ok()
        .filter(|p| !p.is_empty())
        .with_context(|| format!("{env} is not set"))
}

fn url(daemon: &str, path: &str) -> String {
    format!("{}{}", daemon.trim_end_matches('/'), path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = reqwest::Client::new();

    match args.cmd {
        Cmd::Trigger {
            daemon,
            topic,
            length,
        } => {
            let req = TriggerRequest {
                topic,
                length_category: length,
            };
            let resp: TriggerResponse = client
                .post(url(&daemon, "/v1/runs"))
                .json(&req)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Run { daemon, run_id } => {
            let resp: PipelineRun = client
                .get(url(&daemon, &format!("/v1/runs/{run_id}")))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Status { daemon } => {
            let resp: StatusResponse = client
                .get(url(&daemon, "/v1/status"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Activity { daemon, limit } => {
            let resp: ActivityResponse = client
                .get(url(&daemon, "/v1/activity"))
                .query(&[("limit", limit)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Backups { daemon } => {
            let resp: BackupsResponse = client
                .get(url(&daemon, "/v1/backups"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Cancel { daemon, task_id } => {
            let resp: CancelResponse = client
                .delete(url(&daemon, &format!("/v1/tasks/{task_id}")))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Seal {
            input,
            output,
            password_env,
        } => {
            let password = password(&password_env)?;
            let plain = tokio::fs::read(&input)
                .await
                .with_context(|| format!("read {}", input.display()))?;
            // Refuse to seal something the daemon could not parse.
            let text = String::from_utf8(plain.clone()).context("input is not utf-8")?;
            let bundle = SecretBundle::parse(&text)?;
            let blob = secrets::seal(&plain, &password)?;
            tokio::fs::write(&output, blob)
                .await
                .with_context(|| format!("write {}", output.display()))?;
            tracing::info!(credentials = bundle.len(), output = %output.display(), "bundle sealed");
        }
        Cmd::Unseal {
            input,
            output,
            password_env,
            check,
        } => {
            let password = password(&password_env)?;
            let blob = tokio::fs::read(&input)
                .await
                .with_context(|| format!("read {}", input.display()))?;
            let plain = secrets::open(&blob, &password)
                .with_context(|| format!("unseal {}", input.display()))?;
            let text = String::from_utf8(plain.clone()).context("bundle is not utf-8")?;
            let bundle = SecretBundle::parse(&text)?;
            match output {
                Some(output) if !check => {
                    tokio::fs::write(&output, &plain)
                        .await
                        .with_context(|| format!("write {}", output.display()))?;
                    tracing::info!(credentials = bundle.len(), output = %output.display(), "bundle unsealed");
                }
                _ => {
                    let names: Vec<&str> = bundle.iter().map(|(k, _)| k).collect();
                    println!("{}", serde_json::to_string_pretty(&names)?);
                }
            }
        }
    }

    Ok(())
}
