use alfred_core::{Error, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const PREFIX: &str = "backup_";

/// Timestamped snapshot directories under `backups/`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates an empty `backup_YYYYmmdd_HHMMSS` directory, adding a `_NN`
    /// suffix when a snapshot with that name already exists.
    pub fn create_snapshot(&self, now: DateTime<Local>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let base = format!("{}{}", PREFIX, now.format("%Y%m%d_%H%M%S"));
        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{:02}", base, attempt)
            };
            let path = self.dir.join(name);
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Created backup snapshot");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Other(format!("Too many backups named {}", base)))
    }

    /// Snapshot directories, newest first by creation time.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots: Vec<(SystemTime, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(PREFIX))
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| {
                let created = e
                    .metadata()
                    .and_then(|m| m.created().or_else(|_| m.modified()))
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (created, e.path())
            })
            .collect();

        // Names embed the timestamp, so they break ties between equal times.
        snapshots.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(snapshots.into_iter().map(|(_, p)| p).collect())
    }

    /// Deletes the oldest snapshots so at most `max` remain. Returns the
    /// removed paths; a snapshot that cannot be removed is logged and skipped.
    pub fn rotate(&self, max: usize) -> Result<Vec<PathBuf>> {
        let snapshots = self.list()?;
        let mut removed = Vec::new();
        for old in snapshots.into_iter().skip(max) {
            match std::fs::remove_dir_all(&old) {
                Ok(()) => {
                    info!(path = %old.display(), "Removed old backup");
                    removed.push(old);
                }
                Err(e) => warn!(path = %old.display(), error = %e, "Failed to remove old backup"),
            }
        }
        Ok(removed)
    }

    /// Copy of component `id` in the newest snapshot that has one.
    pub fn find_latest_containing(&self, id: &str) -> Option<PathBuf> {
        let snapshots = match self.list() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to list backups");
                return None;
            }
        };
        snapshots
            .into_iter()
            .map(|snapshot| snapshot.join(id))
            .find(|candidate| candidate.is_dir())
    }
}
