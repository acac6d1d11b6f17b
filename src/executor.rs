// Query executor.
// Serves fresh values from the cache, otherwise runs one shared fetch per key
// with per-attempt deadlines and retries, and stores successful results.

use crate::cache::{CacheEntry, CacheStore, FetchOutcome, Lookup, SharedFetch};
use crate::config::{ClientConfig, RetryConfig};
use crate::descriptor::{CachePolicy, Params, ResolvedPolicy, ResourceDescriptor, ResourceKey};
use crate::error::{ClientError, QueryError};
use crate::transport::{HttpTransport, RawPayload, Transport, TransportRequest};
use futures::FutureExt;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    // Per-attempt deadline; the configured timeout when unset
    pub deadline: Option<Duration>,
    // Skip the freshness check and fetch again
    pub force_refetch: bool,
}

impl QueryOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryStats {
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_timeout: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub cache_misses: AtomicUsize,
    pub coalesced: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueryStatsReport {
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub requests_retried: usize,
    pub requests_timeout: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub coalesced: usize,
}

#[derive(Clone)]
pub struct QueryClient {
    config: Arc<ClientConfig>,
    base_url: Url,
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
    stats: Arc<QueryStats>,
}

impl QueryClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let base_url = config.parsed_base_url()?;
        let cache = Arc::new(CacheStore::new(config.event_buffer));

        Ok(Self {
            config: Arc::new(config),
            base_url,
            transport,
            cache,
            stats: Arc::new(QueryStats::default()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn resolve_policy(&self, policy: CachePolicy) -> ResolvedPolicy {
        ResolvedPolicy {
            freshness: policy.freshness.unwrap_or(self.config.default_freshness),
            retry_budget: policy
                .retry_budget
                .unwrap_or(self.config.retry_config.max_retries),
            idempotent: policy.idempotent,
        }
    }

    pub async fn query<R>(
        &self,
        descriptor: &ResourceDescriptor<R>,
        params: &Params,
    ) -> Result<Arc<R>, QueryError>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        self.query_with(descriptor, params, QueryOptions::default())
            .await
    }

    // Fetch again regardless of freshness
    pub async fn refetch<R>(
        &self,
        descriptor: &ResourceDescriptor<R>,
        params: &Params,
    ) -> Result<Arc<R>, QueryError>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        self.query_with(descriptor, params, QueryOptions::forced())
            .await
    }

    pub async fn query_with<R>(
        &self,
        descriptor: &ResourceDescriptor<R>,
        params: &Params,
        options: QueryOptions,
    ) -> Result<Arc<R>, QueryError>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        // Invalid params never reach the network
        let request = self.prepare(descriptor, params)?;
        let key = descriptor.build_key(params);
        let policy = self.resolve_policy(descriptor.policy());
        let deadline = options.deadline.unwrap_or_else(|| self.config.timeout());

        let lookup = self
            .cache
            .join_or_start(&key, Instant::now(), options.force_refetch, |fetch_id| {
                self.spawn_fetch(
                    key.clone(),
                    fetch_id,
                    request,
                    policy,
                    deadline,
                    descriptor.decoder(),
                )
            });

        let entry = match lookup {
            Lookup::Fresh(entry) => {
                self.stats.cache_hits.fetch_add(1, Ordering::SeqCst);
                debug!(key = %key, "cache hit");
                entry
            }
            Lookup::Pending(pending) => {
                if pending.started() {
                    self.stats.cache_misses.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.stats.coalesced.fetch_add(1, Ordering::SeqCst);
                }
                pending.wait().await?
            }
        };

        entry.downcast::<R>().ok_or_else(|| {
            QueryError::SchemaError(format!(
                "cached value for {} is not a {}",
                key,
                std::any::type_name::<R>()
            ))
        })
    }

    /// Cached value for the query, fresh or not, without fetching.
    pub fn cached<R>(&self, descriptor: &ResourceDescriptor<R>, params: &Params) -> Option<Arc<R>>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        self.cache
            .get(&descriptor.build_key(params))
            .and_then(|entry| entry.downcast::<R>())
    }

    pub fn invalidate<R>(&self, descriptor: &ResourceDescriptor<R>, params: &Params) -> bool
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        self.invalidate_key(&descriptor.build_key(params))
    }

    pub fn invalidate_key(&self, key: &ResourceKey) -> bool {
        self.cache.invalidate(key)
    }

    // Drops every cached parameter set of one resource, e.g. after a write
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        self.cache.invalidate_where(|key| key.resource() == resource)
    }

    pub fn invalidate_where(&self, predicate: impl Fn(&ResourceKey) -> bool) -> usize {
        self.cache.invalidate_where(predicate)
    }

    /// Warms the cache for several parameter sets at once. Returns how many
    /// of them settled successfully.
    pub async fn prefetch<R>(&self, descriptor: &ResourceDescriptor<R>, params: Vec<Params>) -> usize
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        let queries = params
            .iter()
            .map(|params| self.query(descriptor, params));
        let results = futures::future::join_all(queries).await;

        results
            .into_iter()
            .filter(|result| match result {
                Ok(_) => true,
                Err(error) => {
                    warn!(resource = descriptor.name(), error = %error, "prefetch failed");
                    false
                }
            })
            .count()
    }

    pub fn stats(&self) -> QueryStatsReport {
        QueryStatsReport {
            requests_sent: self.stats.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.stats.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.stats.requests_failed.load(Ordering::SeqCst),
            requests_retried: self.stats.requests_retried.load(Ordering::SeqCst),
            requests_timeout: self.stats.requests_timeout.load(Ordering::SeqCst),
            cache_hits: self.stats.cache_hits.load(Ordering::SeqCst),
            cache_misses: self.stats.cache_misses.load(Ordering::SeqCst),
            coalesced: self.stats.coalesced.load(Ordering::SeqCst),
        }
    }

    fn prepare<R>(
        &self,
        descriptor: &ResourceDescriptor<R>,
        params: &Params,
    ) -> Result<TransportRequest, QueryError>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        let mut request = descriptor.build_request(&self.base_url, params)?;
        request.headers.extend(self.config.default_headers());
        Ok(request)
    }

    // The fetch runs in its own task so it outlives any single consumer
    fn spawn_fetch(
        &self,
        key: ResourceKey,
        fetch_id: u64,
        request: TransportRequest,
        policy: ResolvedPolicy,
        deadline: Duration,
        decode: fn(&[u8]) -> Result<crate::cache::CachedValue, QueryError>,
    ) -> SharedFetch {
        let transport = Arc::clone(&self.transport);
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let retry = self.config.retry_config.clone();
        let task_key = key.clone();

        debug!(key = %key, fetch_id, url = %request.url, "starting fetch");

        let handle = tokio::spawn(async move {
            let outcome: FetchOutcome = send_with_retry(
                transport.as_ref(),
                &request,
                &policy,
                &retry,
                deadline,
                &stats,
            )
            .await
            .and_then(|payload| decode(&payload.body))
            .map(|value| CacheEntry::new(value, Instant::now(), policy.freshness));

            if let Err(error) = &outcome {
                debug!(key = %task_key, fetch_id, error = %error, "fetch failed");
            }
            cache.settle(&task_key, fetch_id, &outcome);
            outcome
        });

        let cache = Arc::clone(&self.cache);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let outcome: FetchOutcome = Err(QueryError::NetworkError(format!(
                        "fetch task aborted: {}",
                        join_error
                    )));
                    cache.settle(&key, fetch_id, &outcome);
                    outcome
                }
            }
        }
        .boxed()
        .shared()
    }
}

async fn send_with_retry(
    transport: &dyn Transport,
    request: &TransportRequest,
    policy: &ResolvedPolicy,
    retry: &RetryConfig,
    deadline: Duration,
    stats: &QueryStats,
) -> Result<RawPayload, QueryError> {
    let mut attempt: u32 = 0;
    loop {
        stats.requests_sent.fetch_add(1, Ordering::SeqCst);

        let attempt_request = request.clone().with_timeout(deadline);
        let result = match tokio::time::timeout(deadline, transport.send(attempt_request)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(deadline.as_millis() as u64)),
        };

        match result {
            Ok(payload) => {
                stats.requests_succeeded.fetch_add(1, Ordering::SeqCst);
                return Ok(payload);
            }
            Err(error) => {
                if matches!(error, QueryError::Timeout(_)) {
                    stats.requests_timeout.fetch_add(1, Ordering::SeqCst);
                }
                if attempt >= policy.retry_budget || !error.is_retryable(policy.idempotent) {
                    stats.requests_failed.fetch_add(1, Ordering::SeqCst);
                    return Err(error);
                }

                let backoff = retry.backoff(attempt);
                attempt += 1;
                stats.requests_retried.fetch_add(1, Ordering::SeqCst);
                warn!(
                    url = %request.url,
                    attempt,
                    budget = policy.retry_budget,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "retrying request"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
