//! Persistent id → label memo table in front of the knowledge base.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use wikigaps_core::UNKNOWN;

use crate::fetch::FetchError;
use crate::merge::{read_rows, write_rows};
use crate::rows::LabelRow;

/// Remote lookup of display labels by identifier. Ids without a label are omitted.
#[async_trait]
pub trait LabelSource: Send + Sync {
    async fn fetch_labels(&self, ids: &[String]) -> Result<HashMap<String, String>, FetchError>;
}

/// Result of [`LabelCache::labels_for`].
#[derive(Debug, Default, Clone)]
pub struct LabelLookup {
    pub labels: HashMap<String, String>,
    pub cache_hits: usize,
    pub fetched: usize,
    pub unlabelable: usize,
}

/// Label cache backed by `id_labels.csv`. Entries are never invalidated; an empty label
/// records an id the knowledge base had no label for, so it is not requested again.
#[derive(Debug)]
pub struct LabelCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl LabelCache {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows: Vec<LabelRow> = read_rows(&path).await?;
        let mut entries = BTreeMap::new();
        for row in rows {
            entries.insert(row.id.trim().to_string(), row.label.trim().to_string());
        }
        debug!(path = %path.display(), entries = entries.len(), "loaded label cache");
        Ok(Self { path, entries })
    }

    /// Cached label for `id`, if the knowledge base provided a non-empty one.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries
            .get(id)
            .map(String::as_str)
            .filter(|label| !label.is_empty())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Requested ids without any cache entry, de-duplicated in request order.
    pub fn missing(&self, ids: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        ids.iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && !self.contains(id))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }

    /// Resolve labels for `ids`, fetching only ids the cache has never seen. Newly
    /// fetched labels are merged in and the whole store is persisted.
    pub async fn labels_for(
        &mut self,
        ids: &[String],
        source: &dyn LabelSource,
    ) -> Result<LabelLookup> {
        let needed = self.missing(ids);
        let mut fetched = 0;
        let mut unlabelable = 0;

        if !needed.is_empty() {
            let labels = source
                .fetch_labels(&needed)
                .await
                .context("fetching labels for uncached ids")?;
            for id in &needed {
                match labels.get(id).map(|label| label.trim()).filter(|l| !l.is_empty()) {
                    Some(label) => {
                        self.entries.insert(id.clone(), label.to_string());
                        fetched += 1;
                    }
                    None => {
                        self.entries.insert(id.clone(), String::new());
                        unlabelable += 1;
                    }
                }
            }
            self.save().await?;
            info!(
                requested = needed.len(),
                fetched,
                unlabelable,
                cache_size = self.entries.len(),
                "label cache updated"
            );
        }

        let mut lookup = LabelLookup {
            fetched,
            unlabelable,
            ..LabelLookup::default()
        };
        for id in ids {
            let id = id.trim();
            if let Some(label) = self.get(id) {
                lookup.labels.insert(id.to_string(), label.to_string());
            }
        }
        lookup.cache_hits = ids.len().saturating_sub(needed.len());
        Ok(lookup)
    }

    pub async fn save(&self) -> Result<()> {
        let rows: Vec<LabelRow> = self
            .entries
            .iter()
            .map(|(id, label)| LabelRow {
                id: id.clone(),
                label: label.clone(),
            })
            .collect();
        write_rows(&self.path, &rows)
            .await
            .with_context(|| format!("saving label cache {}", self.path.display()))
    }
}

/// First id in list order with a known label, or `"unknown"`.
pub fn select_label<'a>(ids: &[String], labels: &'a HashMap<String, String>) -> &'a str {
    ids.iter()
        .find_map(|id| labels.get(id.as_str()).filter(|label| !label.is_empty()))
        .map(String::as_str)
        .unwrap_or(UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSource {
        known: HashMap<String, String>,
        requests: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingSource {
        fn with(pairs: &[(&str, &str)]) -> Self {
            Self {
                known: pairs
                    .iter()
                    .map(|(id, label)| (id.to_string(), label.to_string()))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<Vec<String>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LabelSource for RecordingSource {
        async fn fetch_labels(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, String>, FetchError> {
            self.requests.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .filter_map(|id| self.known.get(id).map(|label| (id.clone(), label.clone())))
                .collect())
        }
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn cached_ids_are_never_refetched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("id_labels.csv");
        let source = RecordingSource::with(&[("X", "x-label"), ("Y", "y-label")]);

        let mut cache = LabelCache::load(&path).await.unwrap();
        cache.labels_for(&ids(&["X"]), &source).await.unwrap();
        let lookup = cache.labels_for(&ids(&["X", "Y"]), &source).await.unwrap();

        assert_eq!(source.requests(), vec![ids(&["X"]), ids(&["Y"])]);
        assert_eq!(lookup.labels.get("X").map(String::as_str), Some("x-label"));
        assert_eq!(lookup.labels.get("Y").map(String::as_str), Some("y-label"));
        assert_eq!(lookup.cache_hits, 1);
        assert_eq!(lookup.fetched, 1);
    }

    #[tokio::test]
    async fn cache_survives_reload_and_skips_remote_entirely() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache").join("id_labels.csv");
        let source = RecordingSource::with(&[("Q6581097", "male")]);

        let mut cache = LabelCache::load(&path).await.unwrap();
        cache.labels_for(&ids(&["Q6581097"]), &source).await.unwrap();

        let mut reloaded = LabelCache::load(&path).await.unwrap();
        assert_eq!(reloaded.get("Q6581097"), Some("male"));
        reloaded.labels_for(&ids(&["Q6581097"]), &source).await.unwrap();
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn unlabelable_ids_are_omitted_and_not_retried() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("id_labels.csv");
        let source = RecordingSource::with(&[]);

        let mut cache = LabelCache::load(&path).await.unwrap();
        let first = cache.labels_for(&ids(&["Q999"]), &source).await.unwrap();
        let second = cache.labels_for(&ids(&["Q999"]), &source).await.unwrap();

        assert!(first.labels.is_empty());
        assert_eq!(first.unlabelable, 1);
        assert!(second.labels.is_empty());
        assert_eq!(source.requests().len(), 1);
        assert_eq!(cache.get("Q999"), None);
    }

    #[tokio::test]
    async fn duplicate_rows_on_disk_resolve_to_the_last() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("id_labels.csv");
        std::fs::write(&path, "id,label\nQ30,USA\nQ30,United States\n").unwrap();

        let cache = LabelCache::load(&path).await.unwrap();
        assert_eq!(cache.get("Q30"), Some("United States"));

        cache.save().await.unwrap();
        let rows: Vec<LabelRow> = read_rows(&path).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn selection_takes_first_hit_in_list_order() {
        let labels: HashMap<String, String> = [("Q30", "United States"), ("Q145", "United Kingdom")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert_eq!(select_label(&ids(&["Q1", "Q145", "Q30"]), &labels), "United Kingdom");
        assert_eq!(select_label(&ids(&["Q1"]), &labels), UNKNOWN);
        assert_eq!(select_label(&[], &labels), UNKNOWN);
    }
}
