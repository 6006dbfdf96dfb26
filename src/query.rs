//! The per-key query entry and its state machine.
//!
//! A [`Query`] stores the state for one key: status, data, error and fetch
//! metadata. It runs at most one fetch at a time; callers that ask for a fetch
//! while one is in flight receive the same shared future. Attached observers are
//! notified synchronously, in attach order, after every state change.
//!
//! ```text
//! idle ──fetch──▶ loading ──ok──▶ success ──fetch──▶ success (is_fetching)
//!                    │                                   │
//!                    └──err──▶ error ◀───────err─────────┘
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEvent, WeakQueryCache};
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::retryer::Retryer;

/// Status of a query's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// No data and no fetch has started.
    #[default]
    Idle,
    /// The first fetch is running and no data exists yet.
    Loading,
    /// The last fetch failed.
    Error,
    /// Data is available.
    Success,
}

/// Which end of an infinite query a fetch extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Context passed to a user-supplied query function.
#[derive(Debug, Clone)]
pub struct QueryFnContext {
    pub query_key: QueryKey,
    /// Cancelled when the fetch is aborted. Long-running fetches may watch it.
    pub signal: CancellationToken,
}

/// Context passed to the fetch function stored on a query.
///
/// In addition to [`QueryFnContext`] it carries the data cached when the
/// fetch started, which paginated fetches build upon.
#[derive(Debug)]
pub struct FetchContext<T> {
    pub query_key: QueryKey,
    pub signal: CancellationToken,
    pub data: Option<Arc<T>>,
    pub direction: Option<FetchDirection>,
}

/// A user-supplied query function.
pub type QueryFn<T> =
    Arc<dyn Fn(QueryFnContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// The fetch function a query runs.
pub type FetchFn<T> =
    Arc<dyn Fn(FetchContext<T>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// The deduplicated future of an in-flight fetch.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<Arc<T>, QueryError>>>;

/// Adapts a plain query function into a fetch function.
pub fn fetch_fn_from<T: 'static>(query_fn: QueryFn<T>) -> FetchFn<T> {
    Arc::new(move |ctx: FetchContext<T>| {
        query_fn(QueryFnContext {
            query_key: ctx.query_key,
            signal: ctx.signal,
        })
    })
}

/// Snapshot of a query's state.
#[derive(Debug)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub data_update_count: u32,
    pub error_update_count: u32,
    /// Failed attempts of the current or last fetch.
    pub fetch_failure_count: u32,
    pub is_fetching: bool,
    pub is_invalidated: bool,
    pub fetch_direction: Option<FetchDirection>,
}

impl<T> QueryState<T> {
    /// Returns `true` if the data is older than `stale_time`, missing, or invalidated.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            Some(updated_at) => updated_at
                .checked_add(stale_time)
                .is_some_and(|stale_at| stale_at <= Instant::now()),
            None => true,
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            is_fetching: false,
            is_invalidated: false,
            fetch_direction: None,
        }
    }
}

// Manual impl: `Arc<T>` is cloneable without `T: Clone`.
impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            data_update_count: self.data_update_count,
            error_update_count: self.error_update_count,
            fetch_failure_count: self.fetch_failure_count,
            is_fetching: self.is_fetching,
            is_invalidated: self.is_invalidated,
            fetch_direction: self.fetch_direction,
        }
    }
}

/// What happened to a query, as seen by its observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    Updated,
    /// The query was removed from its cache.
    Removed,
}

/// Environment signals that may trigger refetches of stale queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
    WindowFocus,
    Reconnect,
}

/// An observer attached to a query.
pub(crate) trait QueryListener<T>: Send + Sync {
    fn listener_id(&self) -> u64;

    fn on_query_update(&self, event: QueryEvent);

    /// Whether the observer currently wants automatic fetching.
    fn is_enabled(&self) -> bool;

    /// Whether the observer considers the data stale.
    fn is_stale(&self) -> bool;

    /// Starts a refetch if the observer's settings ask for one on `trigger`.
    /// Returns `true` if a fetch was started.
    fn refetch_on(&self, trigger: RefetchTrigger) -> bool;
}

/// Per-call fetch settings.
pub struct FetchOptions<T> {
    /// Cancel a running fetch (when data exists) instead of joining it.
    pub cancel_refetch: bool,
    pub direction: Option<FetchDirection>,
    /// Runs instead of the stored fetch function for this call only.
    pub fetch_fn: Option<FetchFn<T>>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self {
            cancel_refetch: false,
            direction: None,
            fetch_fn: None,
        }
    }
}

struct InFlight<T> {
    id: u64,
    token: CancellationToken,
    future: SharedFetch<T>,
}

struct QueryInner<T> {
    state: QueryState<T>,
    revert_state: Option<QueryState<T>>,
    fetch_fn: Option<FetchFn<T>>,
    config: QueryConfig,
    in_flight: Option<InFlight<T>>,
}

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

/// Cached state for one query key.
pub struct Query<T> {
    key: QueryKey,
    cache: WeakQueryCache,
    inner: Mutex<QueryInner<T>>,
    observers: Mutex<Vec<Arc<dyn QueryListener<T>>>>,
    gc: Mutex<Option<JoinHandle<()>>>,
    removed: AtomicBool,
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("observers", &self.observers.lock().len())
            .finish_non_exhaustive()
    }
}

impl<T> Query<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        key: QueryKey,
        fetch_fn: Option<FetchFn<T>>,
        config: QueryConfig,
        cache: WeakQueryCache,
    ) -> Self {
        Self {
            key,
            cache,
            inner: Mutex::new(QueryInner {
                state: QueryState::default(),
                revert_state: None,
                fetch_fn,
                config,
                in_flight: None,
            }),
            observers: Mutex::new(Vec::new()),
            gc: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.lock().state.clone()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.lock().state.data.clone()
    }

    /// Returns `true` once the query has been removed from its cache.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// The settings the query currently runs with.
    pub fn config(&self) -> QueryConfig {
        self.inner.lock().config.clone()
    }

    /// Updates the stored fetch function and settings.
    ///
    /// The cache time only grows: the longest cache time requested by any
    /// user of the query wins.
    pub(crate) fn set_options(&self, fetch_fn: Option<FetchFn<T>>, config: QueryConfig) {
        let mut inner = self.inner.lock();
        if fetch_fn.is_some() {
            inner.fetch_fn = fetch_fn;
        }
        let cache_time = inner.config.cache_time.max(config.cache_time);
        inner.config = QueryConfig {
            cache_time,
            ..config
        };
    }

    /// Starts a fetch, or joins the one already in flight.
    ///
    /// The returned future is also spawned onto the current tokio runtime, so
    /// the fetch completes whether or not the caller awaits it.
    pub fn fetch(self: &Arc<Self>, options: FetchOptions<T>) -> SharedFetch<T> {
        let mut inner = self.inner.lock();

        if let Some(in_flight) = &inner.in_flight {
            if options.cancel_refetch && inner.state.data_updated_at.is_some() {
                trace!(key = %self.key, "cancelling running fetch for refetch");
                Self::cancel_locked(&mut inner, false);
            } else {
                trace!(key = %self.key, "joining in-flight fetch");
                return in_flight.future.clone();
            }
        }

        let Some(fetch_fn) = options.fetch_fn.or_else(|| inner.fetch_fn.clone()) else {
            warn!(key = %self.key, "fetch requested without a query function");
            return futures::future::ready(Err(QueryError::FetchError(
                "missing query function".to_string(),
            )))
            .boxed()
            .shared();
        };

        let id = NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let retryer = Retryer::with_token(inner.config.retry_policy(), token.clone());
        let key = self.key.clone();
        let data = inner.state.data.clone();
        let direction = options.direction;

        let query = Arc::clone(self);
        let signal = token.clone();
        let future = async move {
            let result = retryer
                .execute(
                    move || {
                        fetch_fn(FetchContext {
                            query_key: key.clone(),
                            signal: signal.clone(),
                            data: data.clone(),
                            direction,
                        })
                    },
                    |count, error| query.on_fetch_failure(id, count, error),
                )
                .await;
            query.finish_fetch(id, result)
        }
        .boxed()
        .shared();

        inner.revert_state = Some(inner.state.clone());
        let state = &mut inner.state;
        state.is_fetching = true;
        state.fetch_failure_count = 0;
        state.fetch_direction = direction;
        if state.data_updated_at.is_none() {
            state.error = None;
            state.status = QueryStatus::Loading;
        }
        inner.in_flight = Some(InFlight {
            id,
            token,
            future: future.clone(),
        });
        drop(inner);

        debug!(key = %self.key, fetch_id = id, "fetch started");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future.clone().map(|_| ()));
            }
            Err(_) => warn!(key = %self.key, "no tokio runtime, fetch runs only when awaited"),
        }

        self.notify(QueryEvent::Updated);
        future
    }

    fn on_fetch_failure(&self, id: u64, count: u32, error: &QueryError) {
        {
            let mut inner = self.inner.lock();
            if inner.in_flight.as_ref().map(|f| f.id) != Some(id) {
                return;
            }
            inner.state.fetch_failure_count = count;
        }
        debug!(key = %self.key, failures = count, %error, "fetch attempt failed");
        self.notify(QueryEvent::Updated);
    }

    fn finish_fetch(self: &Arc<Self>, id: u64, result: Result<T, QueryError>) -> Result<Arc<T>, QueryError> {
        let mut inner = self.inner.lock();
        if inner.in_flight.as_ref().map(|f| f.id) != Some(id) {
            // cancelled or superseded, the state was already settled
            return result.map(Arc::new);
        }
        inner.in_flight = None;
        inner.revert_state = None;

        let now = Instant::now();
        let state = &mut inner.state;
        state.is_fetching = false;
        state.fetch_direction = None;
        let outcome = match result {
            Ok(value) => {
                let data = Arc::new(value);
                state.data = Some(data.clone());
                state.status = QueryStatus::Success;
                state.error = None;
                state.data_updated_at = Some(now);
                state.data_update_count += 1;
                state.fetch_failure_count = 0;
                state.is_invalidated = false;
                debug!(key = %self.key, fetch_id = id, "fetch succeeded");
                Ok(data)
            }
            Err(error) => {
                state.status = QueryStatus::Error;
                state.error = Some(error.clone());
                state.error_updated_at = Some(now);
                state.error_update_count += 1;
                state.fetch_failure_count += 1;
                debug!(key = %self.key, fetch_id = id, %error, "fetch failed");
                Err(error)
            }
        };
        drop(inner);

        self.notify(QueryEvent::Updated);
        if self.observers.lock().is_empty() {
            self.schedule_gc();
        }
        outcome
    }

    fn cancel_locked(inner: &mut QueryInner<T>, revert: bool) -> bool {
        let Some(in_flight) = inner.in_flight.take() else {
            return false;
        };
        in_flight.token.cancel();
        match inner.revert_state.take() {
            Some(previous) if revert => inner.state = previous,
            _ => {
                inner.state.is_fetching = false;
                inner.state.fetch_direction = None;
            }
        }
        true
    }

    /// Cancels the in-flight fetch. With `revert`, the state returns to what it
    /// was before the fetch started.
    pub fn cancel(&self, revert: bool) {
        let cancelled = Self::cancel_locked(&mut self.inner.lock(), revert);
        if cancelled {
            debug!(key = %self.key, revert, "fetch cancelled");
            self.notify(QueryEvent::Updated);
        }
    }

    /// Writes data directly, as if a fetch had succeeded at `updated_at`.
    pub fn set_data(&self, data: T, updated_at: Option<Instant>) -> Arc<T> {
        let data = Arc::new(data);
        {
            let mut inner = self.inner.lock();
            let state = &mut inner.state;
            state.data = Some(data.clone());
            state.status = QueryStatus::Success;
            state.error = None;
            state.data_updated_at = Some(updated_at.unwrap_or_else(Instant::now));
            state.data_update_count += 1;
            state.is_invalidated = false;
        }
        self.notify(QueryEvent::Updated);
        data
    }

    /// Marks the data as stale regardless of its age.
    pub fn invalidate(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.state.is_invalidated, true)
        };
        if changed {
            self.notify(QueryEvent::Updated);
        }
    }

    /// Cancels any fetch and returns to the initial idle state.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            Self::cancel_locked(&mut inner, false);
            inner.state = QueryState::default();
        }
        self.notify(QueryEvent::Updated);
    }

    pub(crate) fn add_observer(&self, listener: Arc<dyn QueryListener<T>>) {
        {
            let mut observers = self.observers.lock();
            if observers
                .iter()
                .any(|o| o.listener_id() == listener.listener_id())
            {
                return;
            }
            observers.push(listener);
        }
        self.clear_gc();
        trace!(key = %self.key, "observer attached");
        self.emit(CacheEvent::ObserverAdded(self.key.hash().to_string()));
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, listener_id: u64) {
        let now_empty = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|o| o.listener_id() != listener_id);
            if observers.len() == before {
                return;
            }
            observers.is_empty()
        };
        trace!(key = %self.key, "observer detached");
        self.emit(CacheEvent::ObserverRemoved(self.key.hash().to_string()));
        if now_empty {
            self.schedule_gc();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Arms the inactivity timer. When it fires, the query is removed from its
    /// cache if it is still unobserved and idle.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        if self.is_removed() {
            return;
        }
        let cache_time = self.inner.lock().config.cache_time;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            tokio::time::sleep(cache_time).await;
            if let Some(query) = weak.upgrade() {
                query.optional_remove();
            }
        });
        if let Some(previous) = self.gc.lock().replace(task) {
            previous.abort();
        }
    }

    fn clear_gc(&self) {
        if let Some(task) = self.gc.lock().take() {
            task.abort();
        }
    }

    fn optional_remove(self: &Arc<Self>) {
        let idle = self.observers.lock().is_empty() && !self.inner.lock().state.is_fetching;
        if !idle {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            debug!(key = %self.key, "garbage collecting inactive query");
            cache.remove_instance(self.key.hash(), Arc::as_ptr(self).cast());
        }
    }

    /// Tears the query down after removal from its cache.
    pub(crate) fn destroy(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear_gc();
        Self::cancel_locked(&mut self.inner.lock(), false);
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            observer.on_query_update(QueryEvent::Removed);
        }
    }

    fn notify(&self, event: QueryEvent) {
        let snapshot: Vec<_> = self.observers.lock().iter().cloned().collect();
        for observer in snapshot {
            observer.on_query_update(event);
        }
        self.emit(CacheEvent::Updated(self.key.hash().to_string()));
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify(event);
        }
    }

    fn trigger(&self, trigger: RefetchTrigger) {
        let snapshot: Vec<_> = self.observers.lock().iter().cloned().collect();
        for observer in snapshot {
            if observer.refetch_on(trigger) {
                break;
            }
        }
    }
}

/// Type-erased view of a [`Query`], used by the cache and by filters.
pub trait AnyQuery: Send + Sync {
    fn query_key(&self) -> &QueryKey;

    fn query_hash(&self) -> &str {
        self.query_key().hash()
    }

    fn status(&self) -> QueryStatus;

    fn is_fetching(&self) -> bool;

    fn is_invalidated(&self) -> bool;

    fn data_updated_at(&self) -> Option<Instant>;

    /// Stale if invalidated, without data, or stale for any observer.
    fn is_stale(&self) -> bool;

    /// Active if any attached observer is enabled.
    fn is_active(&self) -> bool;

    /// Has observers, none of them enabled.
    fn is_disabled(&self) -> bool;

    fn observer_count(&self) -> usize;

    fn invalidate(&self);

    fn cancel(&self, revert: bool);

    fn reset(&self);

    /// Fetches with the stored query function.
    fn refetch(self: Arc<Self>, cancel_refetch: bool) -> BoxFuture<'static, Result<(), QueryError>>;

    fn on_trigger(&self, trigger: RefetchTrigger);

    fn destroy(&self);

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyQuery for Query<T>
where
    T: Send + Sync + 'static,
{
    fn query_key(&self) -> &QueryKey {
        &self.key
    }

    fn status(&self) -> QueryStatus {
        self.inner.lock().state.status
    }

    fn is_fetching(&self) -> bool {
        self.inner.lock().state.is_fetching
    }

    fn is_invalidated(&self) -> bool {
        self.inner.lock().state.is_invalidated
    }

    fn data_updated_at(&self) -> Option<Instant> {
        self.inner.lock().state.data_updated_at
    }

    fn is_stale(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.state.is_invalidated || inner.state.data_updated_at.is_none() {
                return true;
            }
        }
        let snapshot: Vec<_> = self.observers.lock().iter().cloned().collect();
        snapshot.iter().any(|o| o.is_stale())
    }

    fn is_active(&self) -> bool {
        let snapshot: Vec<_> = self.observers.lock().iter().cloned().collect();
        snapshot.iter().any(|o| o.is_enabled())
    }

    fn is_disabled(&self) -> bool {
        self.observer_count() > 0 && !self.is_active()
    }

    fn observer_count(&self) -> usize {
        Query::observer_count(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self);
    }

    fn cancel(&self, revert: bool) {
        Query::cancel(self, revert);
    }

    fn reset(&self) {
        Query::reset(self);
    }

    fn refetch(self: Arc<Self>, cancel_refetch: bool) -> BoxFuture<'static, Result<(), QueryError>> {
        let future = self.fetch(FetchOptions {
            cancel_refetch,
            ..FetchOptions::default()
        });
        future.map(|result| result.map(|_| ())).boxed()
    }

    fn on_trigger(&self, trigger: RefetchTrigger) {
        self.trigger(trigger);
    }

    fn destroy(&self) {
        Query::destroy(self);
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
