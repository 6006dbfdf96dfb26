//! The query cache: a concurrent map from key hash to query.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::{QueryKey, partial_match_key};
use crate::query::{AnyQuery, FetchFn, Query};

/// Notifications published by a [`QueryCache`]. Each carries the query hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Added(String),
    Removed(String),
    Updated(String),
    ObserverAdded(String),
    ObserverRemoved(String),
}

/// Which queries a filter selects by observer activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
    #[default]
    All,
    Active,
    Inactive,
}

/// Custom filter predicate over type-erased queries.
pub type QueryPredicate = Arc<dyn Fn(&dyn AnyQuery) -> bool + Send + Sync>;

/// Selects queries for bulk operations.
///
/// An empty filter matches every query. A key matches by prefix unless
/// `exact` is set.
#[derive(Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    pub exact: bool,
    pub query_type: QueryTypeFilter,
    pub stale: Option<bool>,
    pub fetching: Option<bool>,
    pub predicate: Option<QueryPredicate>,
}

impl QueryFilters {
    /// Matches every query whose key starts with `key`.
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Matches only the query with exactly this key.
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            exact: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_type(mut self, query_type: QueryTypeFilter) -> Self {
        self.query_type = query_type;
        self
    }

    #[must_use]
    pub fn with_predicate(mut self, f: impl Fn(&dyn AnyQuery) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub fn matches(&self, query: &dyn AnyQuery) -> bool {
        if let Some(key) = &self.query_key {
            let matched = if self.exact {
                query.query_hash() == key.hash()
            } else {
                partial_match_key(query.query_key(), key)
            };
            if !matched {
                return false;
            }
        }

        match self.query_type {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }

        if self.stale.is_some_and(|stale| query.is_stale() != stale) {
            return false;
        }
        if self
            .fetching
            .is_some_and(|fetching| query.is_fetching() != fetching)
        {
            return false;
        }
        self.predicate.as_ref().is_none_or(|f| f(query))
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("query_type", &self.query_type)
            .field("stale", &self.stale)
            .field("fetching", &self.fetching)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

struct CacheShared {
    queries: DashMap<String, Arc<dyn AnyQuery>>,
    events: broadcast::Sender<CacheEvent>,
}

/// Stores every query of a client, keyed by hash.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

/// A non-owning handle held by queries to reach their cache.
#[derive(Clone, Default)]
pub(crate) struct WeakQueryCache(Weak<CacheShared>);

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|shared| QueryCache { shared })
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            shared: Arc::new(CacheShared {
                queries: DashMap::new(),
                events,
            }),
        }
    }

    fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Arc::downgrade(&self.shared))
    }

    /// Returns the query for `key`, creating it if needed.
    ///
    /// An existing query takes over `fetch_fn` (when given) and `config`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the cached query for this key
    /// stores a different data type.
    pub fn build<T>(
        &self,
        key: QueryKey,
        fetch_fn: Option<FetchFn<T>>,
        config: QueryConfig,
    ) -> Result<Arc<Query<T>>, QueryError>
    where
        T: Send + Sync + 'static,
    {
        let hash = key.hash().to_string();
        let (query, created) = match self.shared.queries.entry(hash.clone()) {
            Entry::Occupied(entry) => (downcast::<T>(entry.get().clone(), &hash)?, false),
            Entry::Vacant(entry) => {
                let query = Arc::new(Query::new(key, fetch_fn.clone(), config.clone(), self.downgrade()));
                entry.insert(query.clone());
                (query, true)
            }
        };

        if created {
            debug!(key = %hash, "query created");
            self.notify(CacheEvent::Added(hash));
            query.schedule_gc();
        } else {
            query.set_options(fetch_fn, config);
        }
        Ok(query)
    }

    /// Returns the typed query stored under `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the query stores another type.
    pub fn get<T>(&self, hash: &str) -> Result<Option<Arc<Query<T>>>, QueryError>
    where
        T: Send + Sync + 'static,
    {
        self.get_any(hash).map(|q| downcast::<T>(q, hash)).transpose()
    }

    /// Returns the type-erased query stored under `hash`.
    pub fn get_any(&self, hash: &str) -> Option<Arc<dyn AnyQuery>> {
        self.shared.queries.get(hash).map(|q| q.value().clone())
    }

    /// Removes the query under `hash`, cancelling its fetch and notifying its
    /// observers.
    pub fn remove(&self, hash: &str) -> Option<Arc<dyn AnyQuery>> {
        let (hash, query) = self.shared.queries.remove(hash)?;
        self.finish_removal(hash, &query);
        Some(query)
    }

    /// Removes the query under `hash` only if it is the given instance.
    pub(crate) fn remove_instance(&self, hash: &str, instance: *const ()) {
        let removed = self
            .shared
            .queries
            .remove_if(hash, |_, q| Arc::as_ptr(q).cast::<()>() == instance);
        if let Some((hash, query)) = removed {
            self.finish_removal(hash, &query);
        }
    }

    fn finish_removal(&self, hash: String, query: &Arc<dyn AnyQuery>) {
        debug!(key = %hash, "query removed");
        query.destroy();
        self.notify(CacheEvent::Removed(hash));
    }

    /// The first query matching `filters`.
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<dyn AnyQuery>> {
        self.get_all().into_iter().find(|q| filters.matches(q.as_ref()))
    }

    /// All queries matching `filters`.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<dyn AnyQuery>> {
        self.get_all()
            .into_iter()
            .filter(|q| filters.matches(q.as_ref()))
            .collect()
    }

    pub fn get_all(&self) -> Vec<Arc<dyn AnyQuery>> {
        self.shared
            .queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes every query.
    pub fn clear(&self) {
        let hashes: Vec<String> = self
            .shared
            .queries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for hash in hashes {
            self.remove(&hash);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queries.is_empty()
    }

    /// Subscribes to cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn notify(&self, event: CacheEvent) {
        // no receivers is fine
        let _ = self.shared.events.send(event);
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.len())
            .finish()
    }
}

fn downcast<T>(query: Arc<dyn AnyQuery>, hash: &str) -> Result<Arc<Query<T>>, QueryError>
where
    T: Send + Sync + 'static,
{
    query
        .as_any_arc()
        .downcast::<Query<T>>()
        .map_err(|_| QueryError::TypeMismatch {
            query_hash: hash.to_string(),
        })
}
