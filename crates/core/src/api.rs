//! Request and response bodies of the daemon's HTTP surface.

use serde::{Deserialize, Serialize};

use crate::model::{ActivityLogEntry, LengthCategory, PipelineRun, ScheduledTask};

/// Start a run. Without a topic the policy agent chooses one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerRequest {
    /// Manual topic; it may lie outside the action set.
    #[serde(default)]
    pub topic: Option<String>,
    /// Overrides the length bucket of the state.
    #[serde(default)]
    pub length_category: Option<LengthCategory>,
}

/// Trigger response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerResponse {
    /// A run was admitted and is producing in the background.
    Started {
        /// New run id.
        run_id: String,
        /// Topic being produced.
        topic: String,
    },
    /// The resource gate denied entry; nothing was started.
    Postponed {
        /// Gate's explanation, e.g. the load that exceeded its threshold.
        reason: String,
    },
}

/// Current runs and queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Runs still producing.
    pub active_runs: Vec<PipelineRun>,
    /// Latest runs, newest first.
    pub recent_runs: Vec<PipelineRun>,
    /// Pending and running publication tasks.
    pub queue: Vec<ScheduledTask>,
}

/// Most recent activity log entries, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityResponse {
    /// Log lines.
    pub entries: Vec<ActivityLogEntry>,
}

/// One backed-up video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupEntry {
    /// Path under the data directory.
    pub path: String,
    /// File size.
    pub size_bytes: u64,
    /// Unix ms.
    pub modified_ms: i64,
}

/// Every backed-up video.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupsResponse {
    /// Entries sorted by path.
    pub backups: Vec<BackupEntry>,
}

/// Cancel response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// False when the task was unknown or already started.
    pub removed: bool,
}
