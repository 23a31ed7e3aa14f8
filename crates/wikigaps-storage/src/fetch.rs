//! Batched, retrying, rate-limited requests against the remote JSON APIs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Query string pairs for one request.
pub type QueryParams = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only throttling and temporary unavailability are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Linear backoff: the n-th failed attempt (zero based) waits `step * (n + 1)`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index.saturating_add(1)).unwrap_or(u32::MAX);
        self.step.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub polite_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            concurrency: 4,
            batch_size: 50,
            backoff: BackoffPolicy::default(),
            polite_delay: Duration::from_millis(100),
        }
    }
}

/// Per-call overrides for [`BatchFetcher::fetch_batched_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Items per request; the configured batch size when `None`.
    pub batch_size: Option<usize>,
    pub follow_continue: bool,
}

/// Minimum spacing between consecutive requests, shared by every concurrent caller.
#[derive(Debug)]
pub struct PolitenessGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PolitenessGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            tokio::time::sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(
        "{endpoint} unavailable after {attempts} attempts ({})",
        describe_last_status(.last_status)
    )]
    RemoteUnavailable {
        endpoint: String,
        attempts: usize,
        last_status: Option<u16>,
    },
    #[error("{endpoint} returned http {status}: {payload}")]
    RemoteError {
        endpoint: String,
        status: u16,
        payload: String,
    },
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response shape from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch {index} of {total} failed: {source}")]
    Batch {
        index: usize,
        total: usize,
        #[source]
        source: Box<FetchError>,
    },
}

fn describe_last_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("last status {code}"),
        None => "last attempt hit a transport error".to_string(),
    }
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RemoteUnavailable { .. } => true,
            Self::Batch { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

enum Attempt {
    Done(JsonValue),
    Transient(Option<u16>),
    Failed(FetchError),
}

/// Rows gathered from every successful batch, alongside the failures of the others.
#[derive(Debug)]
pub struct BatchResults<R> {
    pub batches: usize,
    pub rows: Vec<R>,
    pub failures: Vec<FetchError>,
}

impl<R> BatchResults<R> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Surface the first failed batch, if any.
    pub fn into_result(self) -> Result<Vec<R>, FetchError> {
        match self.failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(self.rows),
        }
    }
}

#[derive(Debug)]
pub struct BatchFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    concurrency: usize,
    gate: PolitenessGate,
    backoff: BackoffPolicy,
    batch_size: usize,
}

impl BatchFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let concurrency = config.concurrency.max(1);
        let mut backoff = config.backoff;
        backoff.max_attempts = backoff.max_attempts.max(1);

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            gate: PolitenessGate::new(config.polite_delay),
            backoff,
            batch_size: config.batch_size.max(1),
        })
    }

    /// One logical request: paced, retried on transient failures, decoded into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<T, FetchError> {
        let value = self.get_value(endpoint, params).await?;
        decode_value(endpoint, value)
    }

    async fn get_value(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let mut last_status = None;

        for attempt in 0..self.backoff.max_attempts {
            self.gate.wait().await;
            let span = info_span!("http_fetch", endpoint, attempt = attempt + 1);
            match self.attempt(endpoint, params).instrument(span).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Failed(err) => return Err(err),
                Attempt::Transient(status) => {
                    last_status = status;
                    if attempt + 1 < self.backoff.max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            endpoint,
                            attempt = attempt + 1,
                            status = ?status,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(FetchError::RemoteUnavailable {
            endpoint: endpoint.to_string(),
            attempts: self.backoff.max_attempts,
            last_status,
        })
    }

    async fn attempt(&self, endpoint: &str, params: &[(String, String)]) -> Attempt {
        let response = match self.client.get(endpoint).query(params).send().await {
            Ok(response) => response,
            Err(err) => {
                return match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => {
                        debug!(error = %err, "transport error");
                        Attempt::Transient(None)
                    }
                    RetryDisposition::NonRetryable => Attempt::Failed(FetchError::Request {
                        endpoint: endpoint.to_string(),
                        source: err,
                    }),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<JsonValue>().await {
                // MediaWiki reports API-level failures inside a 200 body.
                Ok(body) => match body.get("error") {
                    Some(error) => Attempt::Failed(FetchError::RemoteError {
                        endpoint: endpoint.to_string(),
                        status: status.as_u16(),
                        payload: error.to_string(),
                    }),
                    None => Attempt::Done(body),
                },
                Err(err) => Attempt::Failed(FetchError::Request {
                    endpoint: endpoint.to_string(),
                    source: err,
                }),
            };
        }

        match classify_status(status) {
            RetryDisposition::Retryable => Attempt::Transient(Some(status.as_u16())),
            RetryDisposition::NonRetryable => {
                let payload = response.text().await.unwrap_or_default();
                Attempt::Failed(FetchError::RemoteError {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                    payload,
                })
            }
        }
    }

    /// Split `items` into fixed-size batches, issue one request per batch with bounded
    /// concurrency, and decode each response. Batches succeed or fail independently.
    pub async fn fetch_batched<I, T, R, P, D>(
        &self,
        endpoint: &str,
        items: &[I],
        params: P,
        decode: D,
    ) -> BatchResults<R>
    where
        T: DeserializeOwned + Send,
        R: Send,
        P: Fn(&[I]) -> QueryParams,
        D: Fn(T) -> Vec<R> + Sync,
    {
        self.fetch_batched_with(endpoint, items, BatchOptions::default(), params, decode)
            .await
    }

    /// [`fetch_batched`](Self::fetch_batched) with a per-call batch size and optional
    /// `continue` following inside each batch.
    pub async fn fetch_batched_with<I, T, R, P, D>(
        &self,
        endpoint: &str,
        items: &[I],
        options: BatchOptions,
        params: P,
        decode: D,
    ) -> BatchResults<R>
    where
        T: DeserializeOwned + Send,
        R: Send,
        P: Fn(&[I]) -> QueryParams,
        D: Fn(T) -> Vec<R> + Sync,
    {
        let batch_size = options.batch_size.unwrap_or(self.batch_size).max(1);
        let queries: Vec<QueryParams> = items.chunks(batch_size).map(&params).collect();
        let total = queries.len();
        let decode = &decode;

        let outcomes = stream::iter(queries.into_iter().enumerate())
            .map(|(index, query)| {
                async move {
                    let outcome = self
                        .run_batch::<T>(endpoint, query, options.follow_continue)
                        .await
                        .map(|pages| pages.into_iter().flat_map(decode).collect::<Vec<R>>());
                    (index, outcome)
                }
                .boxed()
            })
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut results = BatchResults {
            batches: total,
            rows: Vec::new(),
            failures: Vec::new(),
        };
        for (index, outcome) in outcomes {
            match outcome {
                Ok(rows) => results.rows.extend(rows),
                Err(err) => {
                    warn!(endpoint, batch = index + 1, total, error = %err, "batch failed");
                    results.failures.push(FetchError::Batch {
                        index: index + 1,
                        total,
                        source: Box::new(err),
                    });
                }
            }
        }
        results
    }

    /// Issue one batch query. With `follow_continue`, the query is repeated with the
    /// `continue` pairs of each response until the API stops returning them.
    async fn run_batch<T: DeserializeOwned + Send>(
        &self,
        endpoint: &str,
        base: QueryParams,
        follow_continue: bool,
    ) -> Result<Vec<T>, FetchError> {
        let mut pages = Vec::new();
        let mut cursor: Option<QueryParams> = None;
        loop {
            let mut query = base.clone();
            if let Some(pairs) = &cursor {
                query.retain(|(key, _)| !pairs.iter().any(|(k, _)| k == key));
                query.extend(pairs.iter().cloned());
            }
            let value = self.get_value(endpoint, &query).await?;
            let next = if follow_continue {
                continuation_pairs(&value)
            } else {
                None
            };
            pages.push(decode_value(endpoint, value)?);

            match next {
                Some(next) if cursor.as_ref() != Some(&next) => {
                    debug!(endpoint, page = pages.len() + 1, "following continuation");
                    cursor = Some(next);
                }
                Some(_) => {
                    warn!(endpoint, "continuation did not advance, stopping");
                    break;
                }
                None => break,
            }
        }
        Ok(pages)
    }
}

fn decode_value<T: DeserializeOwned>(endpoint: &str, value: JsonValue) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|source| FetchError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// Scalar pairs of the `continue` object of a MediaWiki response.
fn continuation_pairs(value: &JsonValue) -> Option<QueryParams> {
    let pairs: QueryParams = value
        .get("continue")?
        .as_object()?
        .iter()
        .filter_map(|(key, value)| match value {
            JsonValue::String(text) => Some((key.clone(), text.clone())),
            JsonValue::Number(number) => Some((key.clone(), number.to_string())),
            _ => None,
        })
        .collect();
    (!pairs.is_empty()).then_some(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(batch_size: usize) -> BatchFetcher {
        BatchFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("wikigaps-test/0.1".into()),
            concurrency: 2,
            batch_size,
            backoff: BackoffPolicy {
                max_attempts: 3,
                step: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            polite_delay: Duration::ZERO,
        })
        .expect("fetcher")
    }

    #[derive(Debug, Deserialize)]
    struct Echo {
        ids: Vec<String>,
    }

    fn ok_ids(ids: &[&str]) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ids": ids }))
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            step: Duration::from_millis(1500),
            max_delay: Duration::from_millis(4000),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn only_throttling_statuses_are_retryable() {
        use RetryDisposition::{NonRetryable, Retryable};
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Retryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), NonRetryable);
    }

    #[tokio::test]
    async fn retries_transient_status_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ok_ids(&["Q1"]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(50);
        let echo: Echo = fetcher
            .get_json(&format!("{}/api", server.uri()), &[])
            .await
            .expect("third attempt succeeds");
        assert_eq!(echo.ids, vec!["Q1"]);
    }

    #[tokio::test]
    async fn gives_up_after_retry_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_fetcher(50)
            .get_json::<JsonValue>(&server.uri(), &[])
            .await
            .expect_err("should exhaust retries");
        match &err {
            FetchError::RemoteUnavailable {
                attempts,
                last_status,
                ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(*last_status, Some(429));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately_with_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such endpoint"))
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_fetcher(50)
            .get_json::<JsonValue>(&server.uri(), &[])
            .await
            .expect_err("404 is permanent");
        match err {
            FetchError::RemoteError { status, payload, .. } => {
                assert_eq!(status, 404);
                assert_eq!(payload, "no such endpoint");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_error_inside_success_body_is_a_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": "badvalue", "info": "Unrecognized value"}
            })))
            .mount(&server)
            .await;

        let err = fast_fetcher(50)
            .get_json::<JsonValue>(&server.uri(), &[])
            .await
            .expect_err("error body");
        assert!(matches!(err, FetchError::RemoteError { status: 200, .. }));
        assert!(err.to_string().contains("badvalue"));
    }

    #[tokio::test]
    async fn batches_are_fixed_size_and_fail_independently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("ids", "a|b"))
            .respond_with(ok_ids(&["a", "b"]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("ids", "c|d"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad batch"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("ids", "e"))
            .respond_with(ok_ids(&["e"]))
            .expect(1)
            .mount(&server)
            .await;

        let items: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let results = fast_fetcher(2)
            .fetch_batched(
                &server.uri(),
                &items,
                |batch: &[String]| vec![("ids".to_string(), batch.join("|"))],
                |echo: Echo| echo.ids,
            )
            .await;

        assert_eq!(results.batches, 3);
        assert_eq!(results.rows, vec!["a", "b", "e"]);
        assert_eq!(results.failures.len(), 1);
        assert!(!results.is_complete());
        match results.into_result() {
            Err(FetchError::Batch { index, total, source }) => {
                assert_eq!((index, total), (2, 3));
                assert!(matches!(*source, FetchError::RemoteError { status: 400, .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_input_issues_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let items: Vec<String> = Vec::new();
        let results = fast_fetcher(50)
            .fetch_batched(
                &server.uri(),
                &items,
                |batch: &[String]| vec![("ids".to_string(), batch.join("|"))],
                |echo: Echo| echo.ids,
            )
            .await;
        assert_eq!(results.batches, 0);
        assert!(results.into_result().expect("no failures").is_empty());
    }

    #[tokio::test]
    async fn continuation_is_followed_within_each_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("ids", "a|b"))
            .and(query_param("idcontinue", "b"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ids": ["b"]})),
            )
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("ids", "a|b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "continue": {"idcontinue": "b", "continue": "||"},
                "ids": ["a"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let items: Vec<String> = vec!["a".into(), "b".into()];
        let options = BatchOptions {
            follow_continue: true,
            ..BatchOptions::default()
        };
        let results = fast_fetcher(50)
            .fetch_batched_with(
                &server.uri(),
                &items,
                options,
                |batch: &[String]| vec![("ids".to_string(), batch.join("|"))],
                |echo: Echo| echo.ids,
            )
            .await;

        assert_eq!(results.batches, 1);
        assert_eq!(results.into_result().expect("complete"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn batch_size_override_sends_one_item_per_request() {
        let server = MockServer::start().await;
        for id in ["a", "b", "c"] {
            Mock::given(method("GET"))
                .and(query_param("ids", id))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"ids": [id]})),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let options = BatchOptions {
            batch_size: Some(1),
            ..BatchOptions::default()
        };
        let results = fast_fetcher(50)
            .fetch_batched_with(
                &server.uri(),
                &items,
                options,
                |batch: &[String]| vec![("ids".to_string(), batch.join("|"))],
                |echo: Echo| echo.ids,
            )
            .await;

        assert_eq!(results.batches, 3);
        assert_eq!(results.into_result().expect("complete"), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn politeness_gate_spaces_requests_across_callers() {
        let gate = Arc::new(PolitenessGate::new(Duration::from_millis(100)));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.wait().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
