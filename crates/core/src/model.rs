//! Runs, tasks, and log records shared by the daemon and its clients.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyState;

/// Target video length bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LengthCategory {
    /// Short-form video.
    Short,
    /// Long-form video.
    Long,
}

impl LengthCategory {
    /// All categories, in encoding order.
    pub const ALL: [LengthCategory; 2] = [LengthCategory::Short, LengthCategory::Long];

    /// Position within [`LengthCategory::ALL`].
    pub fn index(self) -> usize {
        match self {
            LengthCategory::Short => 0,
            LengthCategory::Long => 1,
        }
    }

    /// Duration handed to the script stage.
    pub fn estimated_duration_sec(self) -> u32 {
        match self {
            LengthCategory::Short => 180,
            LengthCategory::Long => 600,
        }
    }

    /// Stable name used on disk and over the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            LengthCategory::Short => "Short",
            LengthCategory::Long => "Long",
        }
    }
}

impl Default for LengthCategory {
    fn default() -> Self {
        Self::Short
    }
}

impl fmt::Display for LengthCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LengthCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(Self::Short),
            "long" => Ok(Self::Long),
            other => anyhow::bail!("unknown length category '{other}' (expected Short or Long)"),
        }
    }
}

/// Coarse subject area of a topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicCategory {
    /// Anything not matched by a more specific category.
    General,
    /// Firewall and filtering.
    Firewall,
    /// Tunnels and VPNs.
    #[serde(rename = "VPN")]
    Vpn,
    /// Dynamic and static routing.
    Routing,
}

impl TopicCategory {
    /// All categories, in encoding order.
    pub const ALL: [TopicCategory; 4] = [
        TopicCategory::General,
        TopicCategory::Firewall,
        TopicCategory::Vpn,
        TopicCategory::Routing,
    ];

    /// Position within [`TopicCategory::ALL`].
    pub fn index(self) -> usize {
        match self {
            TopicCategory::General => 0,
            TopicCategory::Firewall => 1,
            TopicCategory::Vpn => 2,
            TopicCategory::Routing => 3,
        }
    }

    /// Classifies a free-form topic by keyword.
    pub fn for_topic(topic: &str) -> Self {
        let t = topic.to_ascii_lowercase();
        if t.contains("firewall") {
            TopicCategory::Firewall
        } else if t.contains("vpn") {
            TopicCategory::Vpn
        } else if t.contains("routing") || t.contains("ospf") || t.contains("bgp") {
            TopicCategory::Routing
        } else {
            TopicCategory::General
        }
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicCategory::General => "General",
            TopicCategory::Firewall => "Firewall",
            TopicCategory::Vpn => "VPN",
            TopicCategory::Routing => "Routing",
        };
        f.write_str(s)
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no stage started yet.
    Pending,
    /// Stages in progress.
    Running,
    /// Final artifact produced and handed to the scheduler.
    Succeeded,
    /// A stage failed; the run was aborted.
    Failed,
}

impl RunStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    /// Whether the run can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// Production stages, in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Narration script.
    Script,
    /// Speech synthesis.
    Voice,
    /// Image generation.
    Visuals,
    /// Transcription and translation.
    Subtitles,
    /// Final video encode with burned-in subtitles.
    Assembly,
}

impl StageName {
    /// All stages in execution order.
    pub const PIPELINE: [StageName; 5] = [
        StageName::Script,
        StageName::Voice,
        StageName::Visuals,
        StageName::Subtitles,
        StageName::Assembly,
    ];

    /// Lowercase name used in logs and notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Script => "script",
            StageName::Voice => "voice",
            StageName::Visuals => "visuals",
            StageName::Subtitles => "subtitles",
            StageName::Assembly => "assembly",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the production pipeline for a single topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    /// Run id (ULID).
    pub run_id: String,
    /// Topic being produced.
    pub topic: String,
    /// Target length bucket.
    pub length_category: LengthCategory,
    /// Duration requested from the script stage.
    pub estimated_duration_sec: u32,
    /// Policy state the topic was selected in.
    pub state: PolicyState,
    /// Artifacts produced so far, keyed by stage (ordered by pipeline position).
    #[serde(default)]
    pub stage_outputs: BTreeMap<StageName, Vec<PathBuf>>,
    /// Current status.
    pub status: RunStatus,
    /// Final video duration, once assembled.
    #[serde(default)]
    pub duration_sec: Option<f64>,
    /// Failure reason for failed runs.
    #[serde(default)]
    pub error: Option<String>,
    /// Creation time (unix ms).
    pub created_at_ms: i64,
    /// Last mutation time (unix ms).
    pub updated_at_ms: i64,
}

impl PipelineRun {
    /// Final video path, if assembly completed.
    pub fn video_path(&self) -> Option<&PathBuf> {
        self.stage_outputs
            .get(&StageName::Assembly)
            .and_then(|v| v.first())
    }
}

/// Publication target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Primary long-form platform.
    YouTube,
    /// Teaser post linking the primary upload.
    Twitter,
    /// Short reel cut from the video.
    Instagram,
}

impl Platform {
    /// Whether this is the platform published to immediately.
    pub fn is_primary(self) -> bool {
        matches!(self, Platform::YouTube)
    }

    /// Whether publishing reads the video file.
    pub fn needs_video(self) -> bool {
        !matches!(self, Platform::Twitter)
    }

    /// Lowercase name used in logs and config.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deferred work item kinds; dispatched statically by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Upload the finished video to the primary platform.
    PublishPrimary {
        /// Run topic.
        topic: String,
        /// Policy state the topic was chosen in.
        state: PolicyState,
        /// Final video.
        video_path: PathBuf,
        /// Caption files uploaded alongside.
        subtitle_paths: Vec<PathBuf>,
        /// Video length in seconds.
        duration_sec: f64,
    },
    /// Publish to a secondary platform; receives the primary content id.
    PublishSecondary {
        /// Target platform.
        platform: Platform,
        /// Run topic.
        topic: String,
        /// Policy state the topic was chosen in.
        state: PolicyState,
        /// Final video, for platforms that take one.
        video_path: PathBuf,
        /// Video length in seconds.
        duration_sec: f64,
    },
    /// Fetch engagement for a publication and feed the reward back.
    FetchAnalytics {
        /// Platform the publication lives on.
        platform: Platform,
        /// Topic credited with the engagement.
        topic: String,
        /// State the reward is learned against.
        state: PolicyState,
    },
    /// Back up the final video and delete working files.
    ManageStorage {
        /// Topic whose working files are removed.
        topic: String,
        /// Video moved to the backup tree.
        video_path: PathBuf,
    },
}

impl TaskKind {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            TaskKind::PublishPrimary { .. } => "publish_primary".to_string(),
            TaskKind::PublishSecondary { platform, .. } => format!("publish_secondary:{platform}"),
            TaskKind::FetchAnalytics { platform, .. } => format!("fetch_analytics:{platform}"),
            TaskKind::ManageStorage { .. } => "manage_storage".to_string(),
        }
    }

    /// Topic the task belongs to.
    pub fn topic(&self) -> &str {
        match self {
            TaskKind::PublishPrimary { topic, .. }
            | TaskKind::PublishSecondary { topic, .. }
            | TaskKind::FetchAnalytics { topic, .. }
            | TaskKind::ManageStorage { topic, .. } => topic,
        }
    }
}

/// Durable task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its eta and dependency.
    Pending,
    /// Leased by a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// Never run because its dependency did not succeed.
    Skipped,
}

impl TaskStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Inverse of [`TaskStatus::as_str`]; unknown values read as pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "skipped" => TaskStatus::Skipped,
            _ => TaskStatus::Pending,
        }
    }

    /// Whether the task can no longer run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// A task to insert into the durable schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Pre-assigned id so follow-ups can depend on each other.
    pub task_id: String,
    /// Owning run.
    pub run_id: String,
    /// What to do.
    pub kind: TaskKind,
    /// Earliest execution time (unix ms).
    pub eta_ms: i64,
    /// Task that must succeed first; its result becomes this task's input.
    pub depends_on: Option<String>,
}

impl NewTask {
    /// New task with a fresh id.
    pub fn new(run_id: impl Into<String>, kind: TaskKind, eta_ms: i64) -> Self {
        Self {
            task_id: crate::new_ulid().to_string(),
            run_id: run_id.into(),
            kind,
            eta_ms,
            depends_on: None,
        }
    }

    /// Chain after another task.
    pub fn after(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on = Some(task_id.into());
        self
    }
}

/// A task as stored in the durable schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    /// Task id (ULID).
    pub task_id: String,
    /// Run that created the task.
    pub run_id: String,
    /// What to do.
    pub kind: TaskKind,
    /// Earliest start, unix ms.
    pub eta_ms: i64,
    /// Task that must succeed first.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Claims so far, including the current one.
    pub attempts: u32,
    /// Worker holding the lease.
    #[serde(default)]
    pub lease_owner: Option<String>,
    /// Token the holder must present to complete or renew.
    #[serde(default)]
    pub lease_token: Option<String>,
    /// Unix ms after which the lease may be requeued.
    #[serde(default)]
    pub lease_expires_at_ms: Option<i64>,
    /// Handler result (e.g. a platform content id).
    #[serde(default)]
    pub result: Option<String>,
    /// Failure or skip reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Result of `depends_on`, filled in at claim time.
    #[serde(default)]
    pub dependency_result: Option<String>,
    /// Unix ms.
    pub created_at_ms: i64,
    /// Unix ms.
    pub updated_at_ms: i64,
}

/// How a task handler finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler succeeded, optionally producing a result for dependents.
    Succeeded {
        /// Passed to dependents as their `dependency_result`.
        result: Option<String>,
    },
    /// Handler failed; dependents are skipped.
    Failed {
        /// Reason recorded on the task.
        error: String,
    },
}

/// Outcome class of an audited external call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActivityStatus {
    /// The call did what was asked.
    Success,
    /// The call failed.
    Failure,
}

/// One line of the activity log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityLogEntry {
    /// RFC 3339 local time.
    pub timestamp: String,
    /// Platform or subsystem, e.g. `youtube` or `instagram:analytics`.
    pub platform: String,
    /// Run topic.
    pub topic: String,
    /// Outcome class.
    pub status: ActivityStatus,
    /// Free text; never carries credentials.
    #[serde(default)]
    pub details: String,
}

/// Engagement counters for one publication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngagementMetrics {
    /// Play count.
    pub views: u64,
    /// Like count.
    pub likes: u64,
    /// Comment count.
    pub comments: u64,
    /// Click-through rate as a fraction (0.05 = 5%).
    pub ctr: f64,
    /// Average watch time per view.
    pub avg_watch_time_sec: f64,
    /// Comment sentiment in [-1, 1].
    pub sentiment: f64,
}

/// One entry of the performance log, keyed by `media_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceRecord {
    /// RFC 3339 local time of the fetch.
    pub timestamp: String,
    /// Platform content id.
    pub media_id: String,
    /// Produced topic.
    pub topic: String,
    /// State category the reward was learned against.
    pub category: TopicCategory,
    /// State length the reward was learned against.
    pub length: LengthCategory,
    /// Play count.
    pub views: u64,
    /// Like count.
    pub likes: u64,
    /// Comment count.
    pub comments: u64,
    /// `(likes + comments) / views * 100`.
    pub engagement_rate: f64,
    /// Click-through rate as a fraction.
    pub ctr: f64,
    /// Average watch time in seconds.
    pub watch_time: f64,
    /// Comment sentiment in [-1, 1].
    pub sentiment: f64,
    /// `None` when the topic was outside the action set.
    pub reward: Option<f64>,
}
