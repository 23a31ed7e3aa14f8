//! Durable artifact storage and remote batch fetching for wikigaps.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod checkpoint;
pub mod fetch;
pub mod labels;
pub mod merge;
pub mod rows;

pub use checkpoint::{CheckpointStore, QueryWindow, WatermarkPolicy};
pub use fetch::{
    BackoffPolicy, BatchFetcher, BatchOptions, BatchResults, FetchError, HttpClientConfig,
    QueryParams,
};
pub use labels::{select_label, LabelCache, LabelLookup, LabelSource};
pub use merge::{read_rows, upsert, write_rows, CsvRecord, KeyedRecord, UpsertReport};

pub const CRATE_NAME: &str = "wikigaps-storage";

/// File layout of the data directory shared by collection and materialization.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoints.json")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn creations_path(&self) -> PathBuf {
        self.events_dir().join("creations.csv")
    }

    pub fn entities_path(&self) -> PathBuf {
        self.root.join("entities").join("entities.csv")
    }

    pub fn label_cache_path(&self) -> PathBuf {
        self.root.join("cache").join("id_labels.csv")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-run audit dump, named after the date the query window starts.
    pub fn audit_path(&self, kind: &str, since: DateTime<Utc>) -> PathBuf {
        self.events_dir()
            .join(format!("{kind}_{}.csv", since.format("%Y-%m-%d")))
    }

    pub fn normalized_chunk_path(&self, stamp: DateTime<Utc>) -> PathBuf {
        self.root
            .join("processed")
            .join("tmp_normalized")
            .join(format!("normalized_chunk_{}.csv", stamp.format("%Y-%m-%d")))
    }

    pub fn seed_path(&self, stamp: DateTime<Utc>) -> PathBuf {
        self.root
            .join("raw")
            .join(format!("seed_enwiki_{}.csv", stamp.format("%Y-%m-%d")))
    }

    pub fn snapshot_dir(&self, stamp: DateTime<Utc>) -> PathBuf {
        self.root
            .join("processed")
            .join("snapshots")
            .join(stamp.format("%Y-%m-%d").to_string())
    }
}

/// Replace `path` with `bytes` through a temp file in the same directory and a rename,
/// so readers never observe a partially written artifact.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("artifact.csv");

        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn layout_names_dated_artifacts() {
        let layout = DataLayout::new("/data");
        let stamp = Utc.with_ymd_and_hms(2025, 3, 9, 17, 30, 0).unwrap();
        assert_eq!(
            layout.normalized_chunk_path(stamp),
            PathBuf::from("/data/processed/tmp_normalized/normalized_chunk_2025-03-09.csv")
        );
        assert_eq!(layout.seed_path(stamp), PathBuf::from("/data/raw/seed_enwiki_2025-03-09.csv"));
        assert_eq!(
            layout.audit_path("categories", stamp),
            PathBuf::from("/data/events/categories_2025-03-09.csv")
        );
    }
}
