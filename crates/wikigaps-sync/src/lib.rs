//! Collection and materialization runs over the wikigaps data directory.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wikigaps_adapters::{
    discover_all, KnowledgeBase, MediaWikiClient, RecordSource, WikibaseClient,
};
use wikigaps_core::{iso8601, CreationEvent, EntityAttributes, ExternalEntity};
use wikigaps_storage::rows::{CreationRow, EntityRow};
use wikigaps_storage::{
    read_rows, upsert, write_atomic, write_rows, BackoffPolicy, BatchFetcher, CheckpointStore,
    DataLayout, HttpClientConfig, LabelCache, LabelSource, QueryWindow, WatermarkPolicy,
};

pub mod classifier;
pub mod materialize;
pub mod snapshot;

pub use classifier::{BioClassifier, Classification};
pub use materialize::{attribute_ids, materialize, seed_records, SeedOutcome};
pub use snapshot::{export_snapshot, SnapshotManifest};

pub const CRATE_NAME: &str = "wikigaps-sync";

/// Upper bound for the overlap and grace windows; larger values fall back to the defaults.
pub const MAX_WINDOW_DAYS: u64 = 3650;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub source_api: String,
    pub kb_api: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_size: usize,
    pub max_attempts: usize,
    pub backoff_ms: u64,
    pub polite_delay_ms: u64,
    pub concurrency: usize,
    pub overlap_days: i64,
    pub grace_days: i64,
    pub rules_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let days = |key: &str| {
            parsed(key)
                .filter(|v| *v <= MAX_WINDOW_DAYS)
                .map(|v| v as i64)
        };
        let text = |key: &str, default: &str| {
            var(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let http = HttpClientConfig::default();
        let policy = WatermarkPolicy::default();

        Self {
            data_dir: PathBuf::from(text("WIKIGAPS_DATA_DIR", "./data")),
            source_api: text("WIKIGAPS_SOURCE_API", "https://en.wikipedia.org/w/api.php"),
            kb_api: text("WIKIGAPS_KB_API", "https://www.wikidata.org/w/api.php"),
            user_agent: text(
                "WIKIGAPS_USER_AGENT",
                concat!("wikigaps/", env!("CARGO_PKG_VERSION"), " (coverage gap research)"),
            ),
            http_timeout_secs: parsed("WIKIGAPS_HTTP_TIMEOUT_SECS")
                .unwrap_or(http.timeout.as_secs()),
            batch_size: parsed("WIKIGAPS_BATCH_SIZE")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(http.batch_size),
            max_attempts: parsed("WIKIGAPS_MAX_ATTEMPTS")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(http.backoff.max_attempts),
            backoff_ms: parsed("WIKIGAPS_BACKOFF_MS")
                .unwrap_or(http.backoff.step.as_millis() as u64),
            polite_delay_ms: parsed("WIKIGAPS_POLITE_DELAY_MS")
                .unwrap_or(http.polite_delay.as_millis() as u64),
            concurrency: parsed("WIKIGAPS_CONCURRENCY")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(http.concurrency),
            overlap_days: days("WIKIGAPS_OVERLAP_DAYS").unwrap_or(policy.overlap_days),
            grace_days: days("WIKIGAPS_GRACE_DAYS").unwrap_or(policy.grace_days),
            rules_path: var("WIKIGAPS_RULES_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.data_dir.clone())
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                step: Duration::from_millis(self.backoff_ms),
                ..BackoffPolicy::default()
            },
            polite_delay: Duration::from_millis(self.polite_delay_ms),
        }
    }

    pub fn watermark_policy(&self) -> WatermarkPolicy {
        WatermarkPolicy {
            overlap_days: self.overlap_days,
            grace_days: self.grace_days,
        }
    }

    pub fn classifier(&self) -> Result<BioClassifier> {
        match &self.rules_path {
            Some(path) => BioClassifier::from_rules_file(path),
            None => Ok(BioClassifier::default()),
        }
    }
}

/// Remote collaborators of a run. Tests swap in in-memory fakes.
#[derive(Clone)]
pub struct Sources {
    pub records: Arc<dyn RecordSource>,
    pub knowledge_base: Arc<dyn KnowledgeBase>,
    pub labels: Arc<dyn LabelSource>,
}

impl Sources {
    /// MediaWiki and Wikibase clients sharing one fetcher, so concurrency and
    /// politeness limits hold across both APIs.
    pub fn remote(config: &SyncConfig) -> Result<Self> {
        let fetcher = Arc::new(BatchFetcher::new(config.http_config())?);
        let knowledge_base = Arc::new(WikibaseClient::new(fetcher.clone(), config.kb_api.clone()));
        Ok(Self {
            records: Arc::new(MediaWikiClient::new(fetcher, config.source_api.clone())),
            knowledge_base: knowledge_base.clone(),
            labels: knowledge_base,
        })
    }
}

async fn write_run_log<T: Serialize>(layout: &DataLayout, kind: &str, run_id: Uuid, summary: &T) {
    let path = layout.logs_dir().join(format!("{kind}_{run_id}.json"));
    let written = match serde_json::to_vec_pretty(summary) {
        Ok(bytes) => write_atomic(&path, &bytes).await,
        Err(err) => Err(err.into()),
    };
    if let Err(err) = written {
        warn!(path = %path.display(), error = %format!("{err:#}"), "failed to write run log");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectOutcome {
    /// Discovery returned nothing; the checkpoint was left alone.
    NothingNew,
    /// Records were found but none looked biographical; the checkpoint advanced.
    NoBiographies,
    Persisted,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CollectOutcome,
    pub window_since: String,
    pub previous_watermark: String,
    pub new_watermark: Option<String>,
    pub classifier_version: u32,
    pub discovered: usize,
    pub categorized: usize,
    pub biography_like: usize,
    pub linked: usize,
    pub entities_resolved: usize,
    pub creations_resolved: usize,
    pub entity_rows: usize,
    pub creation_rows: usize,
}

/// Linked records joined with their attribute payload. Entities the knowledge base
/// did not return are kept with empty claim lists.
#[derive(Debug, Default)]
struct ResolvedEntities {
    linked: usize,
    resolved: usize,
    entities: Vec<ExternalEntity>,
}

pub struct CollectPipeline {
    layout: DataLayout,
    policy: WatermarkPolicy,
    classifier: BioClassifier,
    sources: Sources,
}

impl CollectPipeline {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let sources = Sources::remote(config)?;
        Self::with_sources(config, sources)
    }

    pub fn with_sources(config: &SyncConfig, sources: Sources) -> Result<Self> {
        Ok(Self {
            layout: config.layout(),
            policy: config.watermark_policy(),
            classifier: config.classifier()?,
            sources,
        })
    }

    pub async fn run_once(&self) -> Result<CollectSummary> {
        self.run_at(Utc::now()).await
    }

    /// One collection run as of `now`. Artifacts are persisted before the checkpoint
    /// moves, so a run that fails anywhere can simply be repeated.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CollectSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut checkpoints = CheckpointStore::new(self.layout.checkpoint_path());
        let checkpoint = checkpoints.load().await.context("stage checkpoint load")?;
        let window = self.policy.query_window(checkpoint.last_run_ts, now);
        info!(%run_id, window = %window, "collection run started");

        let mut summary = CollectSummary {
            run_id,
            started_at,
            finished_at: started_at,
            outcome: CollectOutcome::NothingNew,
            window_since: iso8601::format(&window.since),
            previous_watermark: iso8601::format(&checkpoint.last_run_ts),
            new_watermark: None,
            classifier_version: self.classifier.version(),
            discovered: 0,
            categorized: 0,
            biography_like: 0,
            linked: 0,
            entities_resolved: 0,
            creations_resolved: 0,
            entity_rows: 0,
            creation_rows: 0,
        };

        let records = discover_all(self.sources.records.as_ref(), window.since)
            .await
            .context("stage discovery")?;
        summary.discovered = records.len();
        info!(discovered = records.len(), "discovery finished");

        if records.is_empty() {
            info!("no new records in window; checkpoint unchanged");
            return Ok(self.finish(summary).await);
        }
        write_rows(&self.layout.audit_path("recent_changes", window.since), &records)
            .await
            .context("stage discovery audit")?;

        let record_ids: Vec<u64> = records.iter().map(|r| r.record_id).collect();
        let categories = self
            .sources
            .records
            .categories(&record_ids)
            .await
            .context("stage categories")?;
        summary.categorized = records
            .iter()
            .filter(|r| categories.get(&r.record_id).is_some_and(|c| !c.is_empty()))
            .count();

        let classification = self.classifier.classify(&records, &categories);
        write_rows(&self.layout.audit_path("categories", window.since), &classification.assignments)
            .await
            .context("stage categories audit")?;
        let candidates = classification.bio_records(&records);
        summary.biography_like = candidates.len();
        info!(
            categorized = summary.categorized,
            biography_like = candidates.len(),
            rest = classification.rest.len(),
            "classification finished"
        );

        if candidates.is_empty() {
            info!("no biography-like records; advancing checkpoint only");
            summary.outcome = CollectOutcome::NoBiographies;
            return self.advance(checkpoints, now, summary).await;
        }
        write_rows(&self.layout.audit_path("biography_candidates", window.since), &candidates)
            .await
            .context("stage candidates audit")?;

        let candidate_ids: Vec<u64> = candidates.iter().map(|r| r.record_id).collect();
        let (resolved, creations) = tokio::try_join!(
            self.resolve_entities(&candidate_ids),
            self.resolve_creations(&candidate_ids),
        )?;
        summary.linked = resolved.linked;
        summary.entities_resolved = resolved.resolved;
        summary.creations_resolved = creations.len();

        let report = upsert(
            &self.layout.creations_path(),
            creations.into_iter().map(CreationRow::from).collect(),
        )
        .await
        .context("stage persist creations")?;
        summary.creation_rows = report.merged_rows;
        debug!(?report, "creations upserted");

        let report = upsert(
            &self.layout.entities_path(),
            resolved.entities.into_iter().map(EntityRow::from).collect(),
        )
        .await
        .context("stage persist entities")?;
        summary.entity_rows = report.merged_rows;
        debug!(?report, "entities upserted");

        summary.outcome = CollectOutcome::Persisted;
        self.advance(checkpoints, now, summary).await
    }

    async fn resolve_entities(&self, record_ids: &[u64]) -> Result<ResolvedEntities> {
        let links = self
            .sources
            .records
            .linked_ids(record_ids)
            .await
            .context("stage linked ids")?;

        let external_ids: Vec<String> = links
            .iter()
            .map(|link| link.external_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let attributes: HashMap<String, EntityAttributes> = self
            .sources
            .knowledge_base
            .entity_attributes(&external_ids)
            .await
            .context("stage entity attributes")?
            .into_iter()
            .map(|attrs| (attrs.external_id.clone(), attrs))
            .collect();

        let mut resolved = ResolvedEntities {
            linked: links.len(),
            ..ResolvedEntities::default()
        };
        for link in links {
            let attributes = match attributes.get(&link.external_id) {
                Some(found) => {
                    resolved.resolved += 1;
                    found.clone()
                }
                None => {
                    debug!(
                        record_id = link.record_id,
                        external_id = %link.external_id,
                        "no attribute payload"
                    );
                    EntityAttributes {
                        external_id: link.external_id,
                        ..EntityAttributes::default()
                    }
                }
            };
            resolved.entities.push(ExternalEntity {
                record_id: link.record_id,
                attributes,
            });
        }
        info!(
            requested = record_ids.len(),
            linked = resolved.linked,
            resolved = resolved.resolved,
            "entity resolution finished"
        );
        Ok(resolved)
    }

    async fn resolve_creations(&self, record_ids: &[u64]) -> Result<Vec<CreationEvent>> {
        let creations = self
            .sources
            .records
            .first_revisions(record_ids)
            .await
            .context("stage creation times")?;
        info!(
            requested = record_ids.len(),
            resolved = creations.len(),
            "creation-time resolution finished"
        );
        Ok(creations)
    }

    async fn advance(
        &self,
        mut checkpoints: CheckpointStore,
        now: DateTime<Utc>,
        mut summary: CollectSummary,
    ) -> Result<CollectSummary> {
        let next = checkpoints
            .advance(&self.policy, now)
            .await
            .context("stage checkpoint advance")?;
        summary.new_watermark = Some(iso8601::format(&next.last_run_ts));
        Ok(self.finish(summary).await)
    }

    async fn finish(&self, mut summary: CollectSummary) -> CollectSummary {
        summary.finished_at = Utc::now();
        write_run_log(&self.layout, "collect", summary.run_id, &summary).await;
        info!(
            run_id = %summary.run_id,
            outcome = ?summary.outcome,
            discovered = summary.discovered,
            biography_like = summary.biography_like,
            entity_rows = summary.entity_rows,
            creation_rows = summary.creation_rows,
            "collection run finished"
        );
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub attribute_ids: usize,
    pub label_cache_hits: usize,
    pub labels_fetched: usize,
    pub unlabelable: usize,
    pub normalized_rows: usize,
    pub seed_rows: usize,
    pub seed_unmatched: usize,
    pub seed_malformed: usize,
    pub normalized_path: String,
    pub seed_path: String,
    pub snapshot_manifest: String,
}

pub struct MaterializePipeline {
    layout: DataLayout,
    labels: Arc<dyn LabelSource>,
}

impl MaterializePipeline {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let sources = Sources::remote(config)?;
        Ok(Self::with_label_source(config, sources.labels))
    }

    pub fn with_label_source(config: &SyncConfig, labels: Arc<dyn LabelSource>) -> Self {
        Self {
            layout: config.layout(),
            labels,
        }
    }

    pub async fn run_once(&self) -> Result<MaterializeSummary> {
        self.run_at(Utc::now()).await
    }

    /// Regenerate the dated output artifacts from the persisted entities and creations.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<MaterializeSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let entities_path = self.layout.entities_path();
        if !tokio::fs::try_exists(&entities_path).await.unwrap_or(false) {
            bail!(
                "{} not found; run `wikigaps collect` first",
                entities_path.display()
            );
        }
        let entities: Vec<ExternalEntity> = read_rows::<EntityRow>(&entities_path)
            .await
            .context("stage read entities")?
            .into_iter()
            .map(ExternalEntity::from)
            .collect();
        let creations: Vec<CreationEvent> = read_rows::<CreationRow>(&self.layout.creations_path())
            .await
            .context("stage read creations")?
            .into_iter()
            .map(CreationEvent::from)
            .collect();
        info!(
            %run_id,
            entities = entities.len(),
            creations = creations.len(),
            "materialization started"
        );

        let ids = attribute_ids(&entities);
        let mut cache = LabelCache::load(self.layout.label_cache_path())
            .await
            .context("stage label cache load")?;
        let lookup = cache
            .labels_for(&ids, self.labels.as_ref())
            .await
            .context("stage labels")?;

        let normalized = materialize(&entities, &lookup.labels);
        let normalized_path = self.layout.normalized_chunk_path(now);
        write_rows(&normalized_path, &normalized)
            .await
            .context("stage write normalized chunk")?;

        let seed = seed_records(&creations, &entities);
        if seed.malformed > 0 {
            warn!(malformed = seed.malformed, "seed rows dropped for malformed timestamps");
        }
        let seed_path = self.layout.seed_path(now);
        write_rows(&seed_path, &seed.rows)
            .await
            .context("stage write seed")?;

        let manifest = export_snapshot(&self.layout.snapshot_dir(now), now, &normalized, &seed.rows)
            .await
            .context("stage snapshot export")?;

        let summary = MaterializeSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entities: entities.len(),
            attribute_ids: ids.len(),
            label_cache_hits: lookup.cache_hits,
            labels_fetched: lookup.fetched,
            unlabelable: lookup.unlabelable,
            normalized_rows: normalized.len(),
            seed_rows: seed.rows.len(),
            seed_unmatched: seed.unmatched,
            seed_malformed: seed.malformed,
            normalized_path: normalized_path.display().to_string(),
            seed_path: seed_path.display().to_string(),
            snapshot_manifest: manifest.display().to_string(),
        };
        write_run_log(&self.layout, "materialize", run_id, &summary).await;
        info!(
            %run_id,
            normalized_rows = summary.normalized_rows,
            seed_rows = summary.seed_rows,
            "materialization finished"
        );
        Ok(summary)
    }
}

/// Stored watermark and the window the next collection would scan.
#[derive(Debug, Clone)]
pub struct CheckpointStatus {
    pub path: PathBuf,
    pub stored: bool,
    pub window: QueryWindow,
}

pub async fn checkpoint_status(
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<CheckpointStatus> {
    let store = CheckpointStore::new(config.layout().checkpoint_path());
    let stored = store.peek().await?;
    let watermark = stored.unwrap_or_default().last_run_ts;
    Ok(CheckpointStatus {
        path: store.path().to_path_buf(),
        stored: stored.is_some(),
        window: config.watermark_policy().query_window(watermark, now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_fetcher_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_ms, 1500);
        assert_eq!(config.watermark_policy(), WatermarkPolicy::default());
        assert!(config.rules_path.is_none());
        assert!(config.user_agent.starts_with("wikigaps/"));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("WIKIGAPS_DATA_DIR", "/srv/wikigaps"),
            ("WIKIGAPS_BATCH_SIZE", "20"),
            ("WIKIGAPS_CONCURRENCY", "0"),
            ("WIKIGAPS_OVERLAP_DAYS", "not-a-number"),
            ("WIKIGAPS_POLITE_DELAY_MS", "250"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/srv/wikigaps"));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.overlap_days, 14);

        let http = config.http_config();
        assert_eq!(http.batch_size, 20);
        assert_eq!(http.polite_delay, Duration::from_millis(250));
        assert_eq!(http.backoff.step, Duration::from_millis(1500));
    }

    #[test]
    fn oversized_windows_fall_back_to_defaults() {
        let vars: HashMap<&str, &str> = [
            ("WIKIGAPS_OVERLAP_DAYS", "99999999999999"),
            ("WIKIGAPS_GRACE_DAYS", "3651"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_vars(|key| vars.get(key).map(|v| v.to_string()));

        let policy = WatermarkPolicy::default();
        assert_eq!(config.overlap_days, policy.overlap_days);
        assert_eq!(config.grace_days, policy.grace_days);

        let now = Utc::now();
        let window = config.watermark_policy().query_window(now, now);
        assert!(window.since < now);
    }
}
