//! The query client: owner of a cache and its default settings.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryFilters, QueryTypeFilter};
use crate::config::{QueryConfig, QueryOverrides};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::QueryOptions;
use crate::query::{FetchOptions, QueryState, RefetchTrigger};

/// A client for managing a query cache.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results
/// - Invalidation, refetching and removal of cached queries
/// - Configuration management
///
/// Clones share the same cache.
///
/// # Example
///
/// ```rust
/// use querykit::{QueryClient, QueryConfig};
/// use std::time::Duration;
///
/// let config = QueryConfig::new(
///     Duration::from_secs(30),  // stale_time
///     Duration::from_secs(300), // cache_time
/// );
///
/// let client = QueryClient::with_config(config);
/// assert!(client.cache().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct QueryClient {
    cache: QueryCache,
    config: QueryConfig,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            cache: QueryCache::new(),
            config,
        }
    }

    /// Gets the default query configuration.
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub const fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Merges per-query overrides with the client defaults.
    pub fn resolve(&self, overrides: &QueryOverrides) -> QueryConfig {
        self.config.merge(overrides)
    }

    /// Returns the cached data for `key`, if any.
    pub fn get_query_data<T>(&self, key: &QueryKey) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_query_state::<T>(key).and_then(|state| state.data)
    }

    /// Returns a snapshot of the state cached for `key`.
    pub fn get_query_state<T>(&self, key: &QueryKey) -> Option<QueryState<T>>
    where
        T: Send + Sync + 'static,
    {
        match self.cache.get::<T>(key.hash()) {
            Ok(query) => query.map(|q| q.state()),
            Err(e) => {
                warn!(key = %key, error = %e, "cached query has another type");
                None
            }
        }
    }

    /// Writes data for `key`, creating the query if needed.
    ///
    /// `updater` receives the current data and returns the replacement.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key caches another type.
    pub fn set_query_data<T, F>(&self, key: impl Into<QueryKey>, updater: F) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> T,
    {
        let query = self.cache.build::<T>(key.into(), None, self.config.clone())?;
        let previous = query.data();
        Ok(query.set_data(updater(previous.as_deref()), None))
    }

    /// Returns cached data when fresh, otherwise fetches it.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`QueryError::TypeMismatch`] if the key
    /// caches another type.
    pub async fn fetch_query<T, D>(&self, options: &QueryOptions<T, D>) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
    {
        let config = self.resolve(&options.overrides);
        let stale_time = config.stale_time;
        let query = self
            .cache
            .build(options.key.clone(), options.fetch_fn.clone(), config)?;

        let state = query.state();
        if let Some(data) = state.data.as_ref()
            && !state.is_stale_by_time(stale_time)
        {
            return Ok(data.clone());
        }
        query.fetch(FetchOptions::default()).await
    }

    /// Like [`QueryClient::fetch_query`], discarding the result.
    pub async fn prefetch_query<T, D>(&self, options: &QueryOptions<T, D>)
    where
        T: Send + Sync + 'static,
    {
        if let Err(e) = self.fetch_query(options).await {
            debug!(key = %options.key, error = %e, "prefetch failed");
        }
    }

    /// Marks matching queries stale and refetches the active ones.
    pub async fn invalidate_queries(&self, filters: &QueryFilters) {
        for query in self.cache.find_all(filters) {
            query.invalidate();
        }
        let active = QueryFilters {
            query_type: QueryTypeFilter::Active,
            ..filters.clone()
        };
        self.refetch_queries(&active).await;
    }

    /// Refetches matching queries, skipping those whose observers are all
    /// disabled. Failures are recorded on the queries.
    pub async fn refetch_queries(&self, filters: &QueryFilters) {
        let refetches = self
            .cache
            .find_all(filters)
            .into_iter()
            .filter(|q| !q.is_disabled())
            .map(|q| q.refetch(true));
        for result in join_all(refetches).await {
            if let Err(e) = result {
                debug!(error = %e, "refetch failed");
            }
        }
    }

    /// Cancels in-flight fetches of matching queries, reverting their state.
    pub fn cancel_queries(&self, filters: &QueryFilters) {
        for query in self.cache.find_all(filters) {
            query.cancel(true);
        }
    }

    /// Removes matching queries from the cache.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        for query in self.cache.find_all(filters) {
            self.cache.remove(query.query_hash());
        }
    }

    /// Resets matching queries to their initial state and refetches the
    /// active ones.
    pub async fn reset_queries(&self, filters: &QueryFilters) {
        for query in self.cache.find_all(filters) {
            query.reset();
        }
        let active = QueryFilters {
            query_type: QueryTypeFilter::Active,
            ..filters.clone()
        };
        self.refetch_queries(&active).await;
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        let fetching = QueryFilters {
            fetching: Some(true),
            ..filters.clone()
        };
        self.cache.find_all(&fetching).len()
    }

    /// Refetches stale active queries that opted into focus refetching.
    pub fn on_focus(&self) {
        for query in self.cache.get_all() {
            query.on_trigger(RefetchTrigger::WindowFocus);
        }
    }

    /// Refetches stale active queries that opted into reconnect refetching.
    pub fn on_online(&self) {
        for query in self.cache.get_all() {
            query.on_trigger(RefetchTrigger::Reconnect);
        }
    }

    /// Removes every query.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryFnContext;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_options(calls: Arc<AtomicUsize>) -> QueryOptions<usize> {
        QueryOptions::new("count", move |_: QueryFnContext| {
            let calls = calls.clone();
            async move { Ok::<_, QueryError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }.boxed()
        })
    }

    #[test]
    fn test_query_client_new() {
        let client = QueryClient::new();
        assert_eq!(client.cache().len(), 0);
        assert_eq!(client.config().stale_time, Duration::from_secs(0));
    }

    #[test]
    fn test_query_client_with_config() {
        let config = QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300));
        let client = QueryClient::with_config(config);
        assert_eq!(client.config().stale_time, Duration::from_secs(30));
        assert_eq!(client.config().cache_time, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_set_and_get_query_data() {
        let client = QueryClient::new();
        let key = QueryKey::from("user-123");

        assert!(client.get_query_data::<i32>(&key).is_none());

        let data = client
            .set_query_data(key.clone(), |old: Option<&i32>| old.copied().unwrap_or(0) + 42)
            .expect("should set data");
        assert_eq!(*data, 42);

        client
            .set_query_data(key.clone(), |old: Option<&i32>| old.copied().unwrap_or(0) + 1)
            .expect("should update data");
        assert_eq!(client.get_query_data::<i32>(&key).as_deref(), Some(&43));

        // wrong type reads as absent
        assert!(client.get_query_data::<String>(&key).is_none());
    }

    #[tokio::test]
    async fn test_fetch_query_uses_fresh_cache() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting_options(calls.clone()).stale_time(Duration::from_secs(60));

        assert_eq!(*client.fetch_query(&options).await.expect("should fetch"), 1);
        assert_eq!(*client.fetch_query(&options).await.expect("should hit cache"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_query_refetches_stale_data() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting_options(calls.clone());

        client.fetch_query(&options).await.expect("should fetch");
        assert_eq!(*client.fetch_query(&options).await.expect("should refetch"), 2);
    }

    #[tokio::test]
    async fn test_prefetch_fills_cache() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        client.prefetch_query(&counting_options(calls)).await;
        assert_eq!(
            client.get_query_data::<usize>(&QueryKey::from("count")).as_deref(),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting_options(calls.clone()).stale_time(Duration::from_secs(60));
        client.fetch_query(&options).await.expect("should fetch");

        client.invalidate_queries(&QueryFilters::key("count")).await;

        // inactive queries are only marked
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = client
            .get_query_state::<usize>(&QueryKey::from("count"))
            .expect("query exists");
        assert!(state.is_invalidated);

        assert_eq!(*client.fetch_query(&options).await.expect("should refetch"), 2);
    }

    #[tokio::test]
    async fn test_refetch_queries_refetches_inactive() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        client
            .fetch_query(&counting_options(calls.clone()))
            .await
            .expect("should fetch");

        client.refetch_queries(&QueryFilters::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let client = QueryClient::new();
        client.set_query_data("a", |_: Option<&i32>| 1).expect("should set");
        client.set_query_data("b", |_: Option<&i32>| 2).expect("should set");

        client.remove_queries(&QueryFilters::exact("a"));
        assert_eq!(client.cache().len(), 1);

        client.clear();
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_reset_queries() {
        let client = QueryClient::new();
        client.set_query_data("a", |_: Option<&i32>| 1).expect("should set");
        client.reset_queries(&QueryFilters::key("a")).await;

        let state = client
            .get_query_state::<i32>(&QueryKey::from("a"))
            .expect("query exists");
        assert!(state.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_fetching_and_cancel() {
        let client = QueryClient::new();
        let options = QueryOptions::new("slow", |_: QueryFnContext| {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, QueryError>(1)
            }
            .boxed()
        });
        let query = client
            .cache()
            .build(options.key.clone(), options.fetch_fn.clone(), QueryConfig::default())
            .expect("should build");
        let fetch = query.fetch(FetchOptions::default());

        assert_eq!(client.is_fetching(&QueryFilters::default()), 1);
        client.cancel_queries(&QueryFilters::default());
        assert_eq!(client.is_fetching(&QueryFilters::default()), 0);
        assert_eq!(fetch.await, Err(QueryError::Cancelled));
    }
}
