//! Backup of finished videos and cleanup of working files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use factory_core::api::BackupEntry;
use factory_core::topic_slug;
use tokio::time::interval;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Working directories cleaned after a topic is fully published.
pub const WORK_DIRS: [&str; 4] = ["scripts", "audio", "images", "subtitles"];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StorageReport {
    /// Where the video now lives; `None` if it was already gone.
    pub backup_path: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
}

pub fn backup_root(data_dir: &Path) -> PathBuf {
    data_dir.join("backup")
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Cross-device: copy then delete.
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
    tokio::fs::remove_file(from)
        .await
        .with_context(|| format!("remove {}", from.display()))?;
    Ok(())
}

/// Moves `video_path` to `backup/<slug>/` and removes every working file
/// whose name starts with the topic slug.
pub async fn manage_storage(data_dir: &Path, topic: &str, video_path: &Path) -> Result<StorageReport> {
    let slug = topic_slug(topic);
    let mut report = StorageReport::default();

    let backup_dir = backup_root(data_dir).join(&slug);
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .with_context(|| format!("create {}", backup_dir.display()))?;

    if tokio::fs::try_exists(video_path).await.unwrap_or(false) {
        let name = video_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("video path {} has no file name", video_path.display()))?;
        let dest = backup_dir.join(name);
        move_file(video_path, &dest).await?;
        info!(from = %video_path.display(), to = %dest.display(), "video backed up");
        report.backup_path = Some(dest);
    } else {
        warn!(path = %video_path.display(), "video missing; nothing to back up");
    }

    for dir in WORK_DIRS {
        let dir_path = data_dir.join(dir);
        let mut entries = match tokio::fs::read_dir(&dir_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("list {}", dir_path.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&slug));
            if matches && entry.file_type().await?.is_file() {
                let path = entry.path();
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("remove {}", path.display()))?;
                report.removed.push(path);
            }
        }
    }
    report.removed.sort();
    info!(topic, removed = report.removed.len(), "working files cleaned");
    Ok(report)
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Every file under `backup/`, newest first.
pub fn list_backups(data_dir: &Path) -> Result<Vec<BackupEntry>> {
    let root = backup_root(data_dir);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        let rel = entry.path().strip_prefix(data_dir).unwrap_or(entry.path());
        out.push(BackupEntry {
            path: rel.display().to_string(),
            size_bytes: meta.len(),
            modified_ms: modified_ms(&meta),
        });
    }
    out.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms).then_with(|| a.path.cmp(&b.path)));
    Ok(out)
}

/// Removes `backup/<slug>` directories not modified within `max_age`.
pub fn gc_backups(data_dir: &Path, max_age: Duration, now: SystemTime) -> Result<Vec<PathBuf>> {
    let root = backup_root(data_dir);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut removed = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        // Age of a backup is the age of its newest file.
        let newest = WalkDir::new(entry.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter_map(|m| m.modified().ok())
            .max();
        let Some(newest) = newest else { continue };
        let age = now.duration_since(newest).unwrap_or_default();
        if age > max_age {
            warn!(dir = %entry.path().display(), age_secs = age.as_secs(), "gc removing backup");
            std::fs::remove_dir_all(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
            removed.push(entry.path().to_path_buf());
        }
    }
    Ok(removed)
}

/// Periodic backup pruning; a no-op loop is not started when retention is 0.
pub fn spawn_gc(data_dir: Arc<PathBuf>, retention_days: u64, every: Duration) {
    if retention_days == 0 {
        return;
    }
    let max_age = Duration::from_secs(retention_days * 24 * 60 * 60);
    tokio::spawn(async move {
        let mut tick = interval(every.max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            let dir = Arc::clone(&data_dir);
            let res = tokio::task::spawn_blocking(move || gc_backups(&dir, max_age, SystemTime::now())).await;
            match res {
                Ok(Ok(removed)) if !removed.is_empty() => info!(count = removed.len(), "backup gc done"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "backup gc failed"),
                Err(e) => warn!(error = %e, "backup gc task panicked"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(p: &Path) {
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"x").unwrap();
    }

    #[tokio::test]
    async fn backs_up_video_and_cleans_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        let video = d.join("videos/MikroTik_QoS.mp4");
        touch(&video);
        touch(&d.join("scripts/MikroTik_QoS.txt"));
        touch(&d.join("audio/MikroTik_QoS.wav"));
        touch(&d.join("images/MikroTik_QoS_0.png"));
        touch(&d.join("images/MikroTik_QoS_1.png"));
        touch(&d.join("subtitles/MikroTik_QoS_fa.srt"));
        touch(&d.join("scripts/MikroTik_VLANs.txt"));

        let report = manage_storage(d, "MikroTik QoS", &video).await.unwrap();
        assert_eq!(report.backup_path, Some(d.join("backup/MikroTik_QoS/MikroTik_QoS.mp4")));
        assert!(!video.exists());
        assert!(d.join("backup/MikroTik_QoS/MikroTik_QoS.mp4").exists());
        assert_eq!(report.removed.len(), 5);
        assert!(d.join("scripts/MikroTik_VLANs.txt").exists());

        let backups = list_backups(d).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            PathBuf::from(&backups[0].path),
            PathBuf::from("backup/MikroTik_QoS/MikroTik_QoS.mp4")
        );
    }

    #[tokio::test]
    async fn missing_video_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = manage_storage(dir.path(), "MikroTik QoS", &dir.path().join("videos/none.mp4"))
            .await
            .unwrap();
        assert_eq!(report.backup_path, None);
    }

    #[test]
    fn gc_removes_only_old_backups() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("backup/Old/Old.mp4"));
        let day = Duration::from_secs(24 * 60 * 60);
        assert!(gc_backups(dir.path(), day, SystemTime::now()).unwrap().is_empty());
        let later = SystemTime::now() + day * 2;
        let removed = gc_backups(dir.path(), day, later).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!dir.path().join("backup/Old").exists());
    }
}
