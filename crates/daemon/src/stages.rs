//! Production stage collaborators.
//!
//! Each stage is an external program configured as a [`CommandTemplate`].
//! Every non-empty stdout line is an output path; the assembly stage's last
//! line is `<video path> <duration seconds>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use factory_core::model::StageName;
use factory_core::retry::{FailureClass, RetryPolicy};
use factory_core::topic_slug;

use crate::config::{CommandTemplate, StagesConfig};
use crate::retry::retry_if;
use crate::secrets::SecretBundle;

/// Output of the assembly stage.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledVideo {
    pub path: PathBuf,
    pub duration_sec: f64,
}

/// The five production stages, in pipeline order.
#[async_trait]
pub trait Stages: Send + Sync {
    async fn script(&self, topic: &str, duration_sec: u32) -> Result<PathBuf>;
    async fn voice(&self, topic: &str, script: &Path) -> Result<PathBuf>;
    async fn visuals(&self, topic: &str) -> Result<Vec<PathBuf>>;
    /// Source-language subtitle first; it is the one burned in.
    async fn subtitles(&self, topic: &str, audio: &Path) -> Result<Vec<PathBuf>>;
    async fn assemble(
        &self,
        topic: &str,
        visuals: &[PathBuf],
        audio: &Path,
        burn_in: Option<&Path>,
    ) -> Result<AssembledVideo>;
}

/// Substitutes `{name}` placeholders. Unknown placeholders are left as-is.
pub fn render_args(args: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|a| {
            let mut out = a.clone();
            for (k, v) in vars {
                out = out.replace(&format!("{{{k}}}"), v);
            }
            out
        })
        .collect()
}

/// Non-empty trimmed stdout lines as paths.
pub fn parse_paths(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Parses the `<path> <duration>` line written by the assembly program.
pub fn parse_assembly_output(stdout: &str) -> Result<AssembledVideo> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| anyhow!("assembly produced no output"))?;
    let (path, duration) = line
        .rsplit_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("assembly output {line:?} lacks a duration"))?;
    let duration_sec: f64 = duration
        .trim()
        .parse()
        .with_context(|| format!("assembly duration {duration:?}"))?;
    if !duration_sec.is_finite() || duration_sec < 0.0 {
        anyhow::bail!("assembly duration {duration_sec} out of range");
    }
    Ok(AssembledVideo {
        path: PathBuf::from(path.trim()),
        duration_sec,
    })
}

/// Runs configured external programs, retrying failed invocations.
pub struct CommandStages {
    config: StagesConfig,
    data_dir: PathBuf,
    secrets: Arc<SecretBundle>,
    retry: RetryPolicy,
}

impl CommandStages {
    pub fn new(
        config: StagesConfig,
        data_dir: PathBuf,
        secrets: Arc<SecretBundle>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            data_dir,
            secrets,
            retry,
        }
    }

    fn base_vars(&self, topic: &str) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("topic", topic.to_string());
        vars.insert("slug", topic_slug(topic));
        vars.insert("data_dir", self.data_dir.display().to_string());
        vars
    }

    async fn invoke_once(&self, stage: StageName, template: &CommandTemplate, args: &[String]) -> Result<String> {
        let child = tokio::process::Command::new(&template.program)
            .args(args)
            .current_dir(&self.data_dir)
            .envs(self.secrets.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("{stage}: spawn {}", template.program))?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("{stage}: timed out after {}s", timeout.as_secs()))?
            .with_context(|| format!("{stage}: wait for {}", template.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{stage}: {} exited with {}: {}",
                template.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(stdout)
    }

    async fn invoke(
        &self,
        stage: StageName,
        template: &CommandTemplate,
        vars: &BTreeMap<&str, String>,
    ) -> Result<String> {
        let args = render_args(&template.args, vars);
        tracing::debug!(%stage, program = %template.program, ?args, "running stage command");
        retry_if(
            &self.retry,
            stage.as_str(),
            || self.invoke_once(stage, template, &args),
            |_| FailureClass::Transient,
        )
        .await
    }

    fn resolve(&self, p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            self.data_dir.join(p)
        }
    }

    fn single_path(&self, stage: StageName, stdout: &str) -> Result<PathBuf> {
        parse_paths(stdout)
            .pop()
            .map(|p| self.resolve(p))
            .ok_or_else(|| anyhow!("{stage}: command printed no output path"))
    }
}

#[async_trait]
impl Stages for CommandStages {
    async fn script(&self, topic: &str, duration_sec: u32) -> Result<PathBuf> {
        let mut vars = self.base_vars(topic);
        vars.insert("duration", duration_sec.to_string());
        let out = self.invoke(StageName::Script, &self.config.script, &vars).await?;
        self.single_path(StageName::Script, &out)
    }

    async fn voice(&self, topic: &str, script: &Path) -> Result<PathBuf> {
        let mut vars = self.base_vars(topic);
        vars.insert("script", script.display().to_string());
        let out = self.invoke(StageName::Voice, &self.config.voice, &vars).await?;
        self.single_path(StageName::Voice, &out)
    }

    async fn visuals(&self, topic: &str) -> Result<Vec<PathBuf>> {
        let vars = self.base_vars(topic);
        let out = self.invoke(StageName::Visuals, &self.config.visuals, &vars).await?;
        let paths: Vec<PathBuf> = parse_paths(&out).into_iter().map(|p| self.resolve(p)).collect();
        if paths.is_empty() {
            anyhow::bail!("visuals: command printed no images");
        }
        Ok(paths)
    }

    async fn subtitles(&self, topic: &str, audio: &Path) -> Result<Vec<PathBuf>> {
        let mut vars = self.base_vars(topic);
        vars.insert("audio", audio.display().to_string());
        let out = self.invoke(StageName::Subtitles, &self.config.subtitles, &vars).await?;
        Ok(parse_paths(&out).into_iter().map(|p| self.resolve(p)).collect())
    }

    async fn assemble(
        &self,
        topic: &str,
        visuals: &[PathBuf],
        audio: &Path,
        burn_in: Option<&Path>,
    ) -> Result<AssembledVideo> {
        let mut vars = self.base_vars(topic);
        let joined: Vec<String> = visuals.iter().map(|p| p.display().to_string()).collect();
        vars.insert("visuals", joined.join(","));
        vars.insert("audio", audio.display().to_string());
        vars.insert(
            "subtitle",
            burn_in.map(|p| p.display().to_string()).unwrap_or_default(),
        );
        let out = self.invoke(StageName::Assembly, &self.config.assemble, &vars).await?;
        let mut video = parse_assembly_output(&out)?;
        video.path = self.resolve(video.path);
        Ok(video)
    }
}
