//! Cache-aware queries and mutations on top of [`ApiClient`].
//!
//! A [`QueryClient`] keys every query by a [`QueryKey`]. For each key it keeps
//! a cached result, a [`RequestState`] (`idle -> loading -> success | error`)
//! and, while a fetch is running, an entry in the in-flight registry so that
//! identical concurrent queries share one request.
//!
//! Lifecycle hooks fire global-first, then per-call. Every transition is also
//! published as a [`QueryEvent`] on a broadcast channel.

use crate::cache::{CacheConfig, CacheManager, CacheStats};
use crate::client::ApiClient;
use crate::request::{Body, RequestOptions};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Identifies a query. Keys are ordered tuples of strings.
///
/// ```
/// use querykit::QueryKey;
///
/// let key = QueryKey::from(["users", "42"]);
/// assert_eq!(key.cache_key(), r#"["users","42"]"#);
/// assert!(key.starts_with(&QueryKey::from(["users"])));
/// assert!(!key.starts_with(&QueryKey::from(["posts"])));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueryKey(pub Vec<String>);

impl QueryKey {
    /// Builds a key from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The key's parts.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// The stable string form used as the cache key (a JSON array).
    pub fn cache_key(&self) -> String {
        Value::from(self.0.clone()).to_string()
    }

    /// Returns `true` if `prefix` matches the first parts of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self(vec![part.to_string()])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self(vec![part])
    }
}

impl From<Vec<String>> for QueryKey {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl From<Vec<&str>> for QueryKey {
    fn from(parts: Vec<&str>) -> Self {
        Self::new(parts)
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Never fetched, or invalidated.
    #[default]
    Idle,
    /// A fetch is running.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Observable state of one query key.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Last successful data. Kept while refetching and after a failed refetch.
    pub data: Option<Value>,
    /// Error of the last fetch, if it failed.
    pub error: Option<Error>,
    /// `true` while a fetch is running.
    pub is_fetching: bool,
}

impl RequestState {
    /// Returns `true` while loading.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Returns `true` after a successful fetch.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Returns `true` after a failed fetch.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// A cached query result.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    /// The response data.
    pub data: Value,
    /// When the data was stored.
    pub cached_at: Instant,
    /// How long the data counts as fresh.
    pub stale_time: Duration,
    /// How long the data stays in the cache at all.
    pub cache_time: Duration,
}

impl CachedQuery {
    /// Returns `true` once `stale_time` has passed since the data was cached.
    pub fn is_stale(&self) -> bool {
        is_stale(self.cached_at, self.stale_time)
    }
}

/// `now - cached_at > stale_time`. A `stale_time` of [`Duration::MAX`] never goes stale.
pub fn is_stale(cached_at: Instant, stale_time: Duration) -> bool {
    Instant::now().saturating_duration_since(cached_at) > stale_time
}

/// Query lifecycle callbacks. Every method defaults to a no-op.
///
/// ```
/// use querykit::{Error, QueryHooks, QueryKey};
/// use serde_json::Value;
///
/// struct LogFailures;
///
/// impl QueryHooks for LogFailures {
///     fn on_error(&self, key: &QueryKey, error: &Error) {
///         eprintln!("query {} failed: {}", key, error);
///     }
/// }
/// ```
pub trait QueryHooks: Send + Sync {
    /// Called when a fetch starts.
    fn on_start(&self, _key: &QueryKey) {}

    /// Called with the fetched data.
    fn on_success(&self, _key: &QueryKey, _data: &Value) {}

    /// Called with the fetch error.
    fn on_error(&self, _key: &QueryKey, _error: &Error) {}

    /// Called after `on_success` or `on_error`.
    fn on_settled(&self, _key: &QueryKey, _result: std::result::Result<&Value, &Error>) {}
}

/// Mutation lifecycle callbacks. Every method defaults to a no-op.
pub trait MutationHooks: Send + Sync {
    /// Called before the request is sent.
    fn on_mutate(&self, _path: &str, _body: Option<&Body>) {}

    /// Called with the response data.
    fn on_success(&self, _data: &Value) {}

    /// Called with the request error.
    fn on_error(&self, _error: &Error) {}

    /// Called after `on_success` or `on_error`.
    fn on_settled(&self, _result: std::result::Result<&Value, &Error>) {}
}

/// Events published by a [`QueryClient`].
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A fetch started.
    QueryStart {
        /// The query key.
        key: QueryKey,
    },
    /// A fetch succeeded.
    QuerySuccess {
        /// The query key.
        key: QueryKey,
        /// The fetched data.
        data: Value,
    },
    /// A fetch failed.
    QueryError {
        /// The query key.
        key: QueryKey,
        /// The error.
        error: Error,
    },
    /// A fetch finished, either way.
    QuerySettled {
        /// The query key.
        key: QueryKey,
    },
    /// Data for a key was written to the cache.
    CacheUpdate {
        /// The query key.
        key: QueryKey,
    },
    /// A key was invalidated.
    CacheInvalidate {
        /// The query key.
        key: QueryKey,
    },
    /// The [`RequestState`] of a key changed.
    StateChange {
        /// The query key.
        key: QueryKey,
        /// The new state.
        state: RequestState,
    },
}

impl QueryEvent {
    /// The event name, e.g. `"query:start"`.
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::QueryStart { .. } => "query:start",
            QueryEvent::QuerySuccess { .. } => "query:success",
            QueryEvent::QueryError { .. } => "query:error",
            QueryEvent::QuerySettled { .. } => "query:settled",
            QueryEvent::CacheUpdate { .. } => "cache:update",
            QueryEvent::CacheInvalidate { .. } => "cache:invalidate",
            QueryEvent::StateChange { .. } => "state:change",
        }
    }

    /// The key the event is about.
    pub fn key(&self) -> &QueryKey {
        match self {
            QueryEvent::QueryStart { key }
            | QueryEvent::QuerySuccess { key, .. }
            | QueryEvent::QueryError { key, .. }
            | QueryEvent::QuerySettled { key }
            | QueryEvent::CacheUpdate { key }
            | QueryEvent::CacheInvalidate { key }
            | QueryEvent::StateChange { key, .. } => key,
        }
    }
}

/// Options for [`QueryClient::query`].
///
/// Unset fields fall back to the client's defaults.
#[derive(Clone)]
pub struct QueryOptions {
    /// The query key.
    pub query_key: QueryKey,
    /// Request path, resolved against the API client's base URL.
    pub path: String,
    /// Request options (method defaults to GET).
    pub request: RequestOptions,
    /// How long fetched data counts as fresh.
    pub stale_time: Option<Duration>,
    /// How long fetched data stays cached.
    pub cache_time: Option<Duration>,
    /// Share in-flight requests for the same key.
    pub dedupe: Option<bool>,
    /// Per-call hooks, run after the client's hooks.
    pub hooks: Option<Arc<dyn QueryHooks>>,
}

impl QueryOptions {
    /// Creates options for fetching `path` under `key`.
    pub fn new(key: impl Into<QueryKey>, path: impl Into<String>) -> Self {
        Self {
            query_key: key.into(),
            path: path.into(),
            request: RequestOptions::new(),
            stale_time: None,
            cache_time: None,
            dedupe: None,
            hooks: None,
        }
    }

    /// Sets the request options.
    pub fn request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }

    /// Sets the stale time. [`Duration::MAX`] never goes stale.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets the cache time.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Enables or disables deduplication for this call.
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    /// Sets per-call hooks.
    pub fn hooks(mut self, hooks: impl QueryHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("path", &self.path)
            .field("request", &self.request)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("dedupe", &self.dedupe)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Options for [`QueryClient::mutate`].
#[derive(Clone)]
pub struct MutationOptions {
    /// HTTP method, POST by default.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Request options (the method field is overwritten by `method`).
    pub request: RequestOptions,
    /// Query keys (prefixes) invalidated after a successful mutation.
    pub invalidate: Vec<QueryKey>,
    /// Mutation hooks.
    pub hooks: Option<Arc<dyn MutationHooks>>,
}

impl MutationOptions {
    /// Creates a POST mutation against `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            request: RequestOptions::new(),
            invalidate: Vec::new(),
            hooks: None,
        }
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request options.
    pub fn request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }

    /// Serializes `value` into the request body.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<B: Serialize + ?Sized>(mut self, value: &B) -> Result<Self> {
        self.request = self.request.json(value)?;
        Ok(self)
    }

    /// Invalidates every query whose key starts with `key` once the mutation succeeds.
    pub fn invalidates(mut self, key: impl Into<QueryKey>) -> Self {
        self.invalidate.push(key.into());
        self
    }

    /// Sets the mutation hooks.
    pub fn hooks(mut self, hooks: impl MutationHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("request", &self.request)
            .field("invalidate", &self.invalidate)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

type Fetch = BoxFuture<'static, Result<Value>>;

struct InFlight {
    id: u64,
    fetch: WeakShared<Fetch>,
}

type Registry = Arc<Mutex<HashMap<String, InFlight>>>;

/// Removes a registry entry when its fetch finishes or is dropped unpolled.
struct InFlightGuard {
    registry: Registry,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if registry.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            registry.remove(&self.key);
        }
    }
}

/// Settles a fetch that is dropped before its request finishes: the state
/// goes back to its previous status with `is_fetching` cleared, and the
/// settled hooks and event fire with [`Error::Aborted`].
struct FetchGuard {
    client: QueryClient,
    cache_key: String,
    key: QueryKey,
    previous: QueryStatus,
    hooks: Option<Arc<dyn QueryHooks>>,
    settled: bool,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::debug!(key = %self.cache_key, "Query fetch dropped before settling");

        let previous = self.previous;
        let state = self.client.update_state(&self.cache_key, &self.key, |state| {
            state.status = previous;
            state.is_fetching = false;
        });
        self.client.emit(QueryEvent::StateChange {
            key: self.key.clone(),
            state,
        });

        let aborted = Error::Aborted;
        self.client
            .each_hook(self.hooks.as_deref(), |h| h.on_settled(&self.key, Err(&aborted)));
        self.client.emit(QueryEvent::QuerySettled {
            key: self.key.clone(),
        });
    }
}

struct QueryRecord {
    key: QueryKey,
    state: RequestState,
}

#[derive(Debug, Clone)]
struct QueryDefaults {
    stale_time: Duration,
    cache_time: Duration,
    dedupe: bool,
}

struct QueryInner {
    api: ApiClient,
    cache: CacheManager<CachedQuery>,
    states: Mutex<HashMap<String, QueryRecord>>,
    inflight: Registry,
    next_id: AtomicU64,
    events: broadcast::Sender<QueryEvent>,
    defaults: QueryDefaults,
    hooks: Option<Arc<dyn QueryHooks>>,
}

enum Plan {
    Cached(Value),
    Await(Shared<Fetch>),
}

/// Cache-aware query client.
///
/// Cloning shares the cache, the states and the in-flight registry.
///
/// # Examples
///
/// ```no_run
/// use querykit::{ApiClient, MutationOptions, QueryClient, QueryOptions};
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct User { id: u64, name: String }
///
/// # async fn example() -> Result<(), querykit::Error> {
/// let api = ApiClient::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
/// let queries = QueryClient::builder(api)
///     .stale_time(Duration::from_secs(30))
///     .build();
///
/// let user: User = queries
///     .query(QueryOptions::new(["users", "1"], "/users/1"))
///     .await?;
/// println!("{} is user {}", user.name, user.id);
///
/// let _: serde_json::Value = queries
///     .mutate(
///         MutationOptions::new("/users/1/rename")
///             .json(&serde_json::json!({ "name": "Ada" }))?
///             .invalidates(["users"]),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<QueryInner>,
}

impl QueryClient {
    /// Creates a query client with default settings.
    pub fn new(api: ApiClient) -> Self {
        QueryClientBuilder::new(api).build()
    }

    /// Creates a builder around `api`.
    pub fn builder(api: ApiClient) -> QueryClientBuilder {
        QueryClientBuilder::new(api)
    }

    /// The underlying API client.
    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Subscribes to query events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.inner.events.subscribe()
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Runs a query and deserializes its data into `T`.
    pub async fn query<T>(&self, options: QueryOptions) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let data = self.query_value(options).await?;
        from_data(data)
    }

    /// Runs a query and returns its raw JSON data.
    ///
    /// If a fetch for the same key is already running (and deduplication is
    /// on) this waits for it. Otherwise fresh cached data is returned without
    /// a request. Otherwise a new fetch starts.
    pub async fn query_value(&self, options: QueryOptions) -> Result<Value> {
        let cache_key = options.query_key.cache_key();
        let stale_time = options.stale_time.unwrap_or(self.inner.defaults.stale_time);
        let dedupe = options.dedupe.unwrap_or(self.inner.defaults.dedupe);

        let plan = {
            let mut inflight = self.inner.inflight.lock();

            let joined = if dedupe {
                inflight.get(&cache_key).and_then(|entry| entry.fetch.upgrade())
            } else {
                None
            };

            if let Some(fetch) = joined {
                tracing::debug!(key = %cache_key, "Joining in-flight query");
                Plan::Await(fetch)
            } else {
                match self.inner.cache.get(&cache_key) {
                    Some(cached) if !is_stale(cached.cached_at, stale_time) => {
                        tracing::debug!(key = %cache_key, "Serving fresh cached query");
                        Plan::Cached(cached.data)
                    }
                    _ => {
                        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                        let guard = InFlightGuard {
                            registry: Arc::clone(&self.inner.inflight),
                            key: cache_key.clone(),
                            id,
                        };
                        let client = self.clone();
                        let key = cache_key.clone();
                        let fetch = async move {
                            let _guard = guard;
                            client.fetch(options, key, stale_time).await
                        }
                        .boxed()
                        .shared();

                        if dedupe {
                            if let Some(weak) = fetch.downgrade() {
                                inflight.insert(cache_key, InFlight { id, fetch: weak });
                            }
                        }
                        Plan::Await(fetch)
                    }
                }
            }
        };

        match plan {
            Plan::Cached(data) => Ok(data),
            Plan::Await(fetch) => fetch.await,
        }
    }

    /// Runs a query to warm the cache, discarding the data.
    pub async fn prefetch_query(&self, options: QueryOptions) -> Result<()> {
        self.query_value(options).await.map(|_| ())
    }

    async fn fetch(self, options: QueryOptions, cache_key: String, stale_time: Duration) -> Result<Value> {
        let key = options.query_key.clone();
        let cache_time = options.cache_time.unwrap_or(self.inner.defaults.cache_time);
        let hooks = options.hooks.clone();

        let mut previous = QueryStatus::Idle;
        let state = self.update_state(&cache_key, &key, |state| {
            previous = state.status;
            state.status = QueryStatus::Loading;
            state.error = None;
            state.is_fetching = true;
        });
        let mut guard = FetchGuard {
            client: self.clone(),
            cache_key: cache_key.clone(),
            key: key.clone(),
            previous,
            hooks: hooks.clone(),
            settled: false,
        };
        self.emit(QueryEvent::StateChange {
            key: key.clone(),
            state,
        });
        self.each_hook(hooks.as_deref(), |h| h.on_start(&key));
        self.emit(QueryEvent::QueryStart { key: key.clone() });
        tracing::debug!(key = %cache_key, path = %options.path, "Fetching query");

        let result = self
            .inner
            .api
            .request::<Value>(&options.path, options.request)
            .await
            .map(|response| response.data);
        guard.settled = true;

        match &result {
            Ok(data) => {
                self.store(
                    &cache_key,
                    CachedQuery {
                        data: data.clone(),
                        cached_at: Instant::now(),
                        stale_time,
                        cache_time,
                    },
                );
                let state = self.update_state(&cache_key, &key, |state| {
                    state.status = QueryStatus::Success;
                    state.data = Some(data.clone());
                    state.error = None;
                    state.is_fetching = false;
                });
                self.emit(QueryEvent::CacheUpdate { key: key.clone() });
                self.emit(QueryEvent::StateChange {
                    key: key.clone(),
                    state,
                });
                self.each_hook(hooks.as_deref(), |h| h.on_success(&key, data));
                self.emit(QueryEvent::QuerySuccess {
                    key: key.clone(),
                    data: data.clone(),
                });
            }
            Err(error) => {
                tracing::warn!(key = %cache_key, error = %error, "Query failed");
                let state = self.update_state(&cache_key, &key, |state| {
                    state.status = QueryStatus::Error;
                    state.error = Some(error.clone());
                    state.is_fetching = false;
                });
                self.emit(QueryEvent::StateChange {
                    key: key.clone(),
                    state,
                });
                self.each_hook(hooks.as_deref(), |h| h.on_error(&key, error));
                self.emit(QueryEvent::QueryError {
                    key: key.clone(),
                    error: error.clone(),
                });
            }
        }

        self.each_hook(hooks.as_deref(), |h| h.on_settled(&key, result.as_ref()));
        self.emit(QueryEvent::QuerySettled { key });
        result
    }

    /// Sends a mutation and invalidates the listed keys on success.
    pub async fn mutate<T>(&self, options: MutationOptions) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let MutationOptions {
            method,
            path,
            request,
            invalidate,
            hooks,
        } = options;
        let request = request.method(method);

        if let Some(hooks) = &hooks {
            hooks.on_mutate(&path, request.body.as_ref());
        }
        tracing::debug!(method = %request.method, path = %path, "Running mutation");

        let result = self
            .inner
            .api
            .request::<Value>(&path, request)
            .await
            .map(|response| response.data);

        match &result {
            Ok(data) => {
                for key in &invalidate {
                    self.invalidate_queries(key);
                }
                if let Some(hooks) = &hooks {
                    hooks.on_success(data);
                }
            }
            Err(error) => {
                if let Some(hooks) = &hooks {
                    hooks.on_error(error);
                }
            }
        }
        if let Some(hooks) = &hooks {
            hooks.on_settled(result.as_ref());
        }

        from_data(result?)
    }

    /// Resets every query whose key starts with `prefix` to idle and drops
    /// its cached data. Returns how many keys matched.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let invalidated: Vec<(String, QueryKey)> = {
            let mut states = self.inner.states.lock();
            states
                .iter_mut()
                .filter(|(_, record)| record.key.starts_with(prefix))
                .map(|(cache_key, record)| {
                    record.state = RequestState::default();
                    (cache_key.clone(), record.key.clone())
                })
                .collect()
        };

        for (cache_key, key) in &invalidated {
            self.inner.cache.delete(cache_key);
            self.emit(QueryEvent::CacheInvalidate { key: key.clone() });
            self.emit(QueryEvent::StateChange {
                key: key.clone(),
                state: RequestState::default(),
            });
        }

        tracing::debug!(prefix = %prefix, count = invalidated.len(), "Invalidated queries");
        invalidated.len()
    }

    /// Writes data for `key` directly into the cache and marks it successful.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn set_query_data<D>(&self, key: impl Into<QueryKey>, data: &D) -> Result<()>
    where
        D: Serialize + ?Sized,
    {
        let key = key.into();
        let cache_key = key.cache_key();
        let data =
            serde_json::to_value(data).map_err(|e| Error::SerializationFailed(e.to_string()))?;

        self.store(
            &cache_key,
            CachedQuery {
                data: data.clone(),
                cached_at: Instant::now(),
                stale_time: self.inner.defaults.stale_time,
                cache_time: self.inner.defaults.cache_time,
            },
        );
        let state = self.update_state(&cache_key, &key, |state| {
            state.status = QueryStatus::Success;
            state.data = Some(data);
            state.error = None;
        });
        self.emit(QueryEvent::CacheUpdate { key: key.clone() });
        self.emit(QueryEvent::StateChange { key, state });
        Ok(())
    }

    /// Reads cached data for `key`, stale or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the cached data does not deserialize into `T`.
    pub fn get_query_data<T>(&self, key: impl Into<QueryKey>) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.inner.cache.get(&key.into().cache_key()) {
            Some(cached) => from_data(cached.data).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the state of `key`, idle if it was never queried.
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> RequestState {
        self.inner
            .states
            .lock()
            .get(&key.into().cache_key())
            .map(|record| record.state.clone())
            .unwrap_or_default()
    }

    /// Drops all cached data and query states.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        self.inner.states.lock().clear();
        tracing::debug!("Query cache cleared");
    }

    /// Caches `entry` for its cache time. A key evicted to make room loses
    /// its state as if it had been invalidated.
    fn store(&self, cache_key: &str, entry: CachedQuery) {
        let cache_time = entry.cache_time;
        let Some(evicted) = self.inner.cache.set(cache_key, entry, Some(cache_time)) else {
            return;
        };

        let key = self.inner.states.lock().get_mut(&evicted).map(|record| {
            record.state = RequestState::default();
            record.key.clone()
        });
        if let Some(key) = key {
            tracing::debug!(key = %evicted, "Evicted query reset to idle");
            self.emit(QueryEvent::CacheInvalidate { key: key.clone() });
            self.emit(QueryEvent::StateChange {
                key,
                state: RequestState::default(),
            });
        }
    }

    fn update_state<F>(&self, cache_key: &str, key: &QueryKey, update: F) -> RequestState
    where
        F: FnOnce(&mut RequestState),
    {
        let mut states = self.inner.states.lock();
        let record = states
            .entry(cache_key.to_string())
            .or_insert_with(|| QueryRecord {
                key: key.clone(),
                state: RequestState::default(),
            });
        update(&mut record.state);
        tracing::trace!(key = cache_key, status = %record.state.status, "Query state changed");
        record.state.clone()
    }

    fn each_hook<F>(&self, per_call: Option<&dyn QueryHooks>, call: F)
    where
        F: Fn(&dyn QueryHooks),
    {
        if let Some(global) = self.inner.hooks.as_deref() {
            call(global);
        }
        if let Some(hooks) = per_call {
            call(hooks);
        }
    }

    fn emit(&self, event: QueryEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("api", &self.inner.api)
            .field("defaults", &self.inner.defaults)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

fn from_data<T: DeserializeOwned>(data: Value) -> Result<T> {
    T::deserialize(&data).map_err(|e| Error::DeserializationFailed {
        raw_response: data.to_string(),
        serde_error: e.to_string(),
        status: StatusCode::OK,
    })
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    api: ApiClient,
    defaults: QueryDefaults,
    hooks: Option<Arc<dyn QueryHooks>>,
    cache_config: CacheConfig,
    event_capacity: usize,
}

impl QueryClientBuilder {
    /// Creates a builder with stale time 0, cache time 5 minutes, deduplication
    /// on and an unbounded cache.
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            defaults: QueryDefaults {
                stale_time: Duration::ZERO,
                cache_time: Duration::from_secs(300),
                dedupe: true,
            },
            hooks: None,
            cache_config: CacheConfig {
                max_size: 0,
                ..CacheConfig::default()
            },
            event_capacity: 256,
        }
    }

    /// Default stale time.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.defaults.stale_time = stale_time;
        self
    }

    /// Default cache time.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.defaults.cache_time = cache_time;
        self
    }

    /// Default deduplication setting.
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.defaults.dedupe = dedupe;
        self
    }

    /// Hooks run for every query, before per-call hooks.
    pub fn hooks(mut self, hooks: impl QueryHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Configuration of the underlying cache. With a bounded `max_size`,
    /// evicted queries are reset to idle.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Buffer size of the event channel; slow subscribers miss older events.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Builds the client.
    pub fn build(self) -> QueryClient {
        let (events, _) = broadcast::channel(self.event_capacity);
        QueryClient {
            inner: Arc::new(QueryInner {
                api: self.api,
                cache: CacheManager::new(self.cache_config),
                states: Mutex::new(HashMap::new()),
                inflight: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(0),
                events,
                defaults: self.defaults,
                hooks: self.hooks,
            }),
        }
    }
}
