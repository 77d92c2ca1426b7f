//! Append-only audit trail of external calls, plus the per-publication
//! performance log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use factory_core::model::{ActivityLogEntry, ActivityStatus, PerformanceRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// RFC 3339 local time, as written into every log record.
pub fn local_timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

/// JSON-lines file; one entry per external call.
pub struct ActivityLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &ActivityLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Appends an entry stamped now. Failures are logged, never returned.
    pub async fn record(&self, platform: &str, topic: &str, status: ActivityStatus, details: impl Into<String>) {
        let entry = ActivityLogEntry {
            timestamp: local_timestamp(),
            platform: platform.to_string(),
            topic: topic.to_string(),
            status,
            details: details.into(),
        };
        if let Err(e) = self.append(&entry).await {
            tracing::warn!(error = %e, platform, "activity log write failed");
        }
    }

    /// Last `n` entries, oldest first. Unparseable lines are skipped.
    pub async fn tail(&self, n: usize) -> Result<Vec<ActivityLogEntry>> {
        let _guard = self.lock.lock().await;
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let mut entries: Vec<ActivityLogEntry> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed activity line");
                    None
                }
            })
            .collect();
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
        Ok(entries)
    }
}

/// JSON array of [`PerformanceRecord`] keyed by `media_id`.
pub struct PerformanceLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PerformanceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Vec<PerformanceRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(t) if t.trim().is_empty() => Ok(Vec::new()),
            Ok(t) => serde_json::from_str(&t).with_context(|| format!("parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Inserts `record`, replacing any earlier record for the same media id.
    pub async fn upsert(&self, record: PerformanceRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        match records.iter_mut().find(|r| r.media_id == record.media_id) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
        let json = serde_json::to_string_pretty(&records)?;
        write_atomic(&self.path, json.as_bytes()).await
    }

    pub async fn all(&self) -> Result<Vec<PerformanceRecord>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }
}

/// Writes through a sibling temp file and renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
