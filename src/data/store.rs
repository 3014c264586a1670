//! On-disk home of acquisition logs.
//!
//! One file per configuration, named after it: `<data_dir>/<name><extension>`. A file
//! is never reused by a new configuration; if the name is taken a numeric suffix is
//! appended (`run-1.csv`, `run-2.csv`, ...).

use crate::data::log_writer::{FileDestination, LogDestination};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Directory of log files plus the naming convention.
#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
    extension: String,
}

impl LogStore {
    /// `extension` includes the leading dot, e.g. `".csv"`.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First unused path for `name`.
    pub async fn fresh_path(&self, name: &str) -> AppResult<PathBuf> {
        let mut candidate = self.dir.join(format!("{}{}", name, self.extension));
        let mut suffix = 1u32;
        while tokio::fs::try_exists(&candidate).await? {
            candidate = self
                .dir
                .join(format!("{}-{}{}", name, suffix, self.extension));
            suffix += 1;
        }
        Ok(candidate)
    }

    /// Create a fresh log for `name` and write its header.
    pub async fn create(&self, name: &str, run_id: Uuid) -> AppResult<(PathBuf, FileDestination)> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(DaqError::LogIo)?;
        let path = self.fresh_path(name).await?;

        let mut dest = FileDestination::create(&path)
            .await
            .map_err(DaqError::LogIo)?;
        dest.write(header_lines(name, run_id, Local::now()).as_bytes())
            .await
            .map_err(DaqError::LogIo)?;

        info!(path = %path.display(), %run_id, "Created acquisition log");
        Ok((path, dest))
    }

    /// Reopen an existing log in append mode.
    pub async fn reopen(&self, path: &Path) -> AppResult<FileDestination> {
        let dest = FileDestination::append(path)
            .await
            .map_err(DaqError::LogIo)?;
        info!(path = %path.display(), "Reopened acquisition log");
        Ok(dest)
    }

    /// File names (not paths) of all logs, sorted.
    pub async fn list(&self) -> AppResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&self.extension) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove everything inside the data directory. Returns the number of entries removed.
    pub async fn purge(&self) -> AppResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            removed += 1;
        }
        info!(dir = %self.dir.display(), removed, "Purged data directory");
        Ok(removed)
    }
}

/// Comment block opening every log file.
pub fn header_lines(name: &str, run_id: Uuid, now: DateTime<Local>) -> String {
    format!(
        "### {} Data Acquisition: {} (run {})\n\n\
         ### [Ard], localTime(us), sincroTime(us), sensorTime(us), distance(mm), accX(g), accY(g), accZ(g), gyrX(gr/s), gyrY(gr/s), gyrZ(gr/s)\n\
         ### [<channel>], localTime(us), level\n\n",
        now.format("%Y-%m-%d %H:%M:%S%.3f %z"),
        name,
        run_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_writes_header_and_avoids_reuse() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("data"), ".csv");

        let (first, mut dest) = store.create("trial", Uuid::new_v4()).await.unwrap();
        dest.close().await.unwrap();
        let (second, mut dest) = store.create("trial", Uuid::new_v4()).await.unwrap();
        dest.close().await.unwrap();

        assert_eq!(first.file_name().unwrap(), "trial.csv");
        assert_eq!(second.file_name().unwrap(), "trial-1.csv");

        let header = std::fs::read_to_string(&first).unwrap();
        assert!(header.starts_with("### "));
        assert!(header.contains("Data Acquisition: trial"));
        assert!(header.contains("### [Ard], localTime(us)"));

        assert_eq!(store.list().await.unwrap(), vec!["trial-1.csv", "trial.csv"]);
    }

    #[tokio::test]
    async fn test_list_and_purge_missing_dir() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("nowhere"), ".csv");
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.purge().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_removes_everything() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path(), ".csv");
        std::fs::write(dir.path().join("a.csv"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("old")).unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a.csv"]);
        assert_eq!(store.purge().await.unwrap(), 3);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_header_lines() {
        let id = Uuid::nil();
        let header = header_lines("bench", id, Local::now());
        assert!(header.contains("(run 00000000-0000-0000-0000-000000000000)"));
        assert_eq!(header.lines().count(), 5);
        assert!(header.lines().filter(|l| !l.is_empty()).all(|l| l.starts_with("###")));
    }
}
