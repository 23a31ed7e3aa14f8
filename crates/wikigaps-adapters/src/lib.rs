//! Remote source contracts plus the MediaWiki and Wikibase clients that implement them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use wikigaps_core::{
    iso8601, AttributeKind, CreationEvent, DiscoveredRecord, EntityAttributes, LinkedId,
};
use wikigaps_storage::{BatchFetcher, BatchOptions, FetchError, LabelSource, QueryParams};

pub const CRATE_NAME: &str = "wikigaps-adapters";

/// Opaque continuation returned by the source; every pair is echoed on the next request.
pub type Continuation = BTreeMap<String, String>;

/// Category names per record id.
pub type CategoryMap = HashMap<u64, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryPage {
    pub records: Vec<DiscoveredRecord>,
    pub next: Option<Continuation>,
}

/// Query-source contract: paginated discovery and batched per-record lookups.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn discovery_page(
        &self,
        since: DateTime<Utc>,
        cursor: Option<&Continuation>,
    ) -> Result<DiscoveryPage, FetchError>;

    async fn categories(&self, record_ids: &[u64]) -> Result<CategoryMap, FetchError>;

    /// Records without a knowledge-base link are left out.
    async fn linked_ids(&self, record_ids: &[u64]) -> Result<Vec<LinkedId>, FetchError>;

    /// Oldest revision per record; records without history are left out.
    async fn first_revisions(&self, record_ids: &[u64]) -> Result<Vec<CreationEvent>, FetchError>;
}

/// Knowledge-base contract: claim lists and labels per entity.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn entity_attributes(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<EntityAttributes>, FetchError>;
}

/// Lazily walk discovery pages from `since` until the source stops returning a
/// continuation. Each poll is one remote call; the stream cannot be restarted.
pub fn discover<'a>(
    source: &'a dyn RecordSource,
    since: DateTime<Utc>,
) -> impl Stream<Item = Result<Vec<DiscoveredRecord>, FetchError>> + Send + 'a {
    enum Cursor {
        Start,
        Next(Continuation),
        Done,
    }

    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let token = match cursor {
            Cursor::Done => return Ok::<_, FetchError>(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };
        let page = source.discovery_page(since, token.as_ref()).await?;
        let next = match page.next {
            Some(token) if !token.is_empty() => Cursor::Next(token),
            _ => Cursor::Done,
        };
        Ok::<_, FetchError>(Some((page.records, next)))
    })
}

/// Drain [`discover`], keeping the first appearance of each record id.
pub async fn discover_all(
    source: &dyn RecordSource,
    since: DateTime<Utc>,
) -> Result<Vec<DiscoveredRecord>, FetchError> {
    let mut pages = std::pin::pin!(discover(source, since));
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut page_count = 0usize;
    while let Some(page) = pages.try_next().await? {
        page_count += 1;
        records.extend(page.into_iter().filter(|r| seen.insert(r.record_id)));
    }
    debug!(pages = page_count, records = records.len(), "discovery exhausted");
    Ok(records)
}

fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

fn join_record_ids(ids: &[u64]) -> String {
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join("|")
}

fn query_pages_params(record_ids: &[u64], extra: &[(&str, &str)]) -> QueryParams {
    let mut params = vec![
        param("action", "query"),
        param("format", "json"),
        param("formatversion", "2"),
        param("pageids", join_record_ids(record_ids)),
    ];
    params.extend(extra.iter().map(|(k, v)| param(k, *v)));
    params
}

#[derive(Debug, Deserialize)]
struct QueryPages<P> {
    query: Option<PagesBody<P>>,
}

#[derive(Debug, Deserialize)]
struct PagesBody<P> {
    #[serde(default = "Vec::new")]
    pages: Vec<P>,
}

impl<P> QueryPages<P> {
    fn into_pages(self) -> Vec<P> {
        self.query.map(|q| q.pages).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RecentChangesResponse {
    #[serde(default)]
    query: Option<RecentChangesBody>,
    #[serde(default, rename = "continue")]
    continuation: Option<Continuation>,
}

#[derive(Debug, Deserialize)]
struct RecentChangesBody {
    #[serde(default)]
    recentchanges: Vec<RecentChange>,
}

#[derive(Debug, Deserialize)]
struct RecentChange {
    #[serde(default)]
    pageid: Option<u64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct CategoryPage {
    #[serde(default)]
    pageid: Option<u64>,
    #[serde(default)]
    categories: Vec<CategoryRef>,
}

#[derive(Debug, Deserialize)]
struct CategoryRef {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct PagePropsPage {
    #[serde(default)]
    pageid: Option<u64>,
    #[serde(default)]
    pageprops: Option<PageProps>,
}

#[derive(Debug, Deserialize)]
struct PageProps {
    #[serde(default)]
    wikibase_item: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionsPage {
    #[serde(default)]
    pageid: Option<u64>,
    #[serde(default)]
    revisions: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    #[serde(default)]
    timestamp: Option<String>,
}

/// Client for the MediaWiki action API of the source wiki.
#[derive(Debug, Clone)]
pub struct MediaWikiClient {
    fetcher: Arc<BatchFetcher>,
    endpoint: String,
}

impl MediaWikiClient {
    pub fn new(fetcher: Arc<BatchFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }

    fn discovery_params(since: DateTime<Utc>, cursor: Option<&Continuation>) -> QueryParams {
        let mut params = vec![
            param("action", "query"),
            param("format", "json"),
            param("formatversion", "2"),
            param("list", "recentchanges"),
            param("rcnamespace", "0"),
            param("rctype", "new"),
            param("rcdir", "newer"),
            param("rcprop", "title|ids|timestamp"),
            param("rclimit", "max"),
            param("rcstart", iso8601::format(&since)),
        ];
        if let Some(cursor) = cursor {
            params.extend(cursor.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        params
    }
}

#[async_trait]
impl RecordSource for MediaWikiClient {
    async fn discovery_page(
        &self,
        since: DateTime<Utc>,
        cursor: Option<&Continuation>,
    ) -> Result<DiscoveryPage, FetchError> {
        let params = Self::discovery_params(since, cursor);
        let response: RecentChangesResponse = self.fetcher.get_json(&self.endpoint, &params).await?;

        let changes = response.query.map(|q| q.recentchanges).unwrap_or_default();
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            let Some(record_id) = change.pageid.filter(|id| *id > 0) else {
                continue;
            };
            match iso8601::parse(&change.timestamp) {
                Some(created_at) => records.push(DiscoveredRecord {
                    record_id,
                    title: change.title,
                    created_at,
                }),
                None => warn!(
                    record_id,
                    timestamp = %change.timestamp,
                    "skipping change with malformed timestamp"
                ),
            }
        }

        Ok(DiscoveryPage {
            records,
            next: response.continuation.filter(|c| !c.is_empty()),
        })
    }

    async fn categories(&self, record_ids: &[u64]) -> Result<CategoryMap, FetchError> {
        let pairs = self
            .fetcher
            .fetch_batched_with(
                &self.endpoint,
                record_ids,
                // cllimit caps the whole batch, so later pages arrive under `clcontinue`.
                BatchOptions {
                    follow_continue: true,
                    ..BatchOptions::default()
                },
                |batch: &[u64]| {
                    query_pages_params(
                        batch,
                        &[("prop", "categories"), ("cllimit", "max"), ("clshow", "!hidden")],
                    )
                },
                |response: QueryPages<CategoryPage>| {
                    response
                        .into_pages()
                        .into_iter()
                        .filter_map(|page| page.pageid.map(|id| (id, page.categories)))
                        .flat_map(|(id, categories)| {
                            categories
                                .into_iter()
                                .filter(|c| !c.title.is_empty())
                                .map(move |c| (id, c.title))
                        })
                        .collect()
                },
            )
            .await
            .into_result()?;

        let mut map = CategoryMap::new();
        for (record_id, category) in pairs {
            map.entry(record_id).or_default().push(category);
        }
        Ok(map)
    }

    async fn linked_ids(&self, record_ids: &[u64]) -> Result<Vec<LinkedId>, FetchError> {
        let links = self
            .fetcher
            .fetch_batched(
                &self.endpoint,
                record_ids,
                |batch: &[u64]| {
                    query_pages_params(batch, &[("prop", "pageprops"), ("ppprop", "wikibase_item")])
                },
                |response: QueryPages<PagePropsPage>| {
                    response
                        .into_pages()
                        .into_iter()
                        .filter_map(|page| {
                            let record_id = page.pageid?;
                            let external_id = page
                                .pageprops
                                .and_then(|props| props.wikibase_item)
                                .filter(|id| !id.trim().is_empty());
                            if external_id.is_none() {
                                debug!(record_id, "no knowledge-base link");
                            }
                            Some(LinkedId {
                                record_id,
                                external_id: external_id?,
                            })
                        })
                        .collect()
                },
            )
            .await
            .into_result()?;
        Ok(links)
    }

    async fn first_revisions(&self, record_ids: &[u64]) -> Result<Vec<CreationEvent>, FetchError> {
        let events = self
            .fetcher
            .fetch_batched_with(
                &self.endpoint,
                record_ids,
                // rvdir and rvlimit are only accepted for a single page.
                BatchOptions {
                    batch_size: Some(1),
                    ..BatchOptions::default()
                },
                |batch: &[u64]| {
                    query_pages_params(
                        batch,
                        &[
                            ("prop", "revisions"),
                            ("rvprop", "timestamp|ids"),
                            ("rvdir", "newer"),
                            ("rvlimit", "1"),
                        ],
                    )
                },
                |response: QueryPages<RevisionsPage>| {
                    response
                        .into_pages()
                        .into_iter()
                        .filter_map(|page| {
                            let record_id = page.pageid?;
                            let first = page.revisions.into_iter().next().and_then(|r| r.timestamp);
                            if first.is_none() {
                                debug!(record_id, "no revision history yet");
                            }
                            Some(CreationEvent {
                                record_id,
                                first_revision_ts: first?,
                            })
                        })
                        .collect()
                },
            )
            .await
            .into_result()?;
        Ok(events)
    }
}

#[derive(Debug, Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    entities: BTreeMap<String, JsonValue>,
}

fn english_label(entity: &JsonValue) -> Option<String> {
    entity
        .pointer("/labels/en/value")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

/// Item ids claimed for `property`, in claim order. Non-item values are skipped.
fn claim_item_ids(entity: &JsonValue, property: &str) -> Vec<String> {
    entity
        .get("claims")
        .and_then(|claims| claims.get(property))
        .and_then(JsonValue::as_array)
        .map(|claims| {
            claims
                .iter()
                .filter_map(|claim| claim.pointer("/mainsnak/datavalue/value/id"))
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_missing(entity: &JsonValue) -> bool {
    entity.get("missing").is_some()
}

/// Client for the Wikibase API of the linked knowledge base.
#[derive(Debug, Clone)]
pub struct WikibaseClient {
    fetcher: Arc<BatchFetcher>,
    endpoint: String,
}

impl WikibaseClient {
    pub fn new(fetcher: Arc<BatchFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }

    fn entity_params(ids: &[String], props: &str) -> QueryParams {
        vec![
            param("action", "wbgetentities"),
            param("format", "json"),
            param("ids", ids.join("|")),
            param("props", props),
            param("languages", "en"),
        ]
    }
}

#[async_trait]
impl KnowledgeBase for WikibaseClient {
    async fn entity_attributes(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<EntityAttributes>, FetchError> {
        let entities = self
            .fetcher
            .fetch_batched(
                &self.endpoint,
                external_ids,
                |batch: &[String]| Self::entity_params(batch, "claims|labels"),
                |response: EntitiesResponse| {
                    response
                        .entities
                        .into_iter()
                        .filter(|(id, entity)| {
                            let missing = is_missing(entity);
                            if missing {
                                debug!(external_id = %id, "entity missing from knowledge base");
                            }
                            !missing
                        })
                        .map(|(external_id, entity)| {
                            let mut attributes = EntityAttributes {
                                external_id,
                                label: english_label(&entity),
                                ..EntityAttributes::default()
                            };
                            for kind in AttributeKind::ALL {
                                *attributes.ids_mut(kind) =
                                    claim_item_ids(&entity, kind.property_id());
                            }
                            attributes
                        })
                        .collect()
                },
            )
            .await
            .into_result()?;
        Ok(entities)
    }
}

#[async_trait]
impl LabelSource for WikibaseClient {
    async fn fetch_labels(&self, ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        let labels = self
            .fetcher
            .fetch_batched(
                &self.endpoint,
                ids,
                |batch: &[String]| Self::entity_params(batch, "labels"),
                |response: EntitiesResponse| {
                    response
                        .entities
                        .into_iter()
                        .filter_map(|(id, entity)| english_label(&entity).map(|label| (id, label)))
                        .collect()
                },
            )
            .await
            .into_result()?;
        Ok(labels.into_iter().collect())
    }
}
