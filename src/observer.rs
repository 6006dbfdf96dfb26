//! Observers: per-consumer views of a query.
//!
//! A [`QueryObserver`] binds to one [`Query`] in the client's cache and derives
//! a [`QueryObserverResult`] from its state. The result passes through the
//! optional `select` transform and, with `keep_previous_data`, keeps showing the
//! previous key's data while the new key loads.
//!
//! Results are recomputed synchronously on every query change. When the new
//! result differs shallowly from the last one (flags by value, data by `Arc`
//! identity) every subscriber is called, in subscription order.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use querykit::{QueryClient, QueryObserver, QueryOptions};
//!
//! # async fn example() -> Result<(), querykit::QueryError> {
//! let client = QueryClient::new();
//! let options = QueryOptions::new("user", |_ctx| {
//!     async { Ok::<_, querykit::QueryError>("Alice".to_string()) }.boxed()
//! });
//! let observer = QueryObserver::new(&client, options)?;
//!
//! let subscription = observer.subscribe(|result| {
//!     if let Some(name) = &result.data {
//!         println!("hello {name}");
//!     }
//! });
//! # drop(subscription);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_stream::wrappers::{IntervalStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::client::QueryClient;
use crate::config::{QueryConfig, QueryOverrides};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{
    FetchDirection, FetchFn, FetchOptions, Query, QueryEvent, QueryFnContext, QueryListener,
    QueryState, QueryStatus, RefetchTrigger, SharedFetch, fetch_fn_from,
};
use crate::retryer::{Retry, RetryDelay};
use crate::subscription::{Listeners, Subscription};

/// Transform applied to query data before it is exposed.
pub type SelectFn<T, D> = Arc<dyn Fn(&Arc<T>) -> Arc<D> + Send + Sync>;

/// Options for a query observer.
///
/// `T` is the type the query function returns and the cache stores. `D` is
/// the type exposed through results, `T` unless [`QueryOptions::select`] is
/// used. Settings left unset fall back to the client's [`QueryConfig`].
pub struct QueryOptions<T, D = T> {
    pub key: QueryKey,
    pub fetch_fn: Option<FetchFn<T>>,
    pub select: SelectFn<T, D>,
    /// Disabled observers never fetch on their own.
    pub enabled: bool,
    pub overrides: QueryOverrides,
}

impl<T> QueryOptions<T>
where
    T: Send + Sync + 'static,
{
    /// Creates options for `key` fetched by `query_fn`.
    pub fn new<F>(key: impl Into<QueryKey>, query_fn: F) -> Self
    where
        F: Fn(QueryFnContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self::from_fetch_fn(key, fetch_fn_from(Arc::new(query_fn)))
    }

    /// Creates options from a fetch function that sees the cached data.
    pub fn from_fetch_fn(key: impl Into<QueryKey>, fetch_fn: FetchFn<T>) -> Self {
        Self {
            key: key.into(),
            fetch_fn: Some(fetch_fn),
            select: Arc::new(|data: &Arc<T>| Arc::clone(data)),
            enabled: true,
            overrides: QueryOverrides::default(),
        }
    }
}

impl<T, D> QueryOptions<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Exposes `f(data)` instead of the cached data.
    ///
    /// The transform runs again only when the cached data changes.
    pub fn select<E>(self, f: impl Fn(&T) -> E + Send + Sync + 'static) -> QueryOptions<T, E>
    where
        E: Send + Sync + 'static,
    {
        QueryOptions {
            key: self.key,
            fetch_fn: self.fetch_fn,
            select: Arc::new(move |data: &Arc<T>| Arc::new(f(data.as_ref()))),
            enabled: self.enabled,
            overrides: self.overrides,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.overrides.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.overrides.cache_time = Some(cache_time);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.overrides.retry = Some(retry.into());
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.overrides.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub fn refetch_on_mount(mut self, refetch: bool) -> Self {
        self.overrides.refetch_on_mount = Some(refetch);
        self
    }

    #[must_use]
    pub fn refetch_on_window_focus(mut self, refetch: bool) -> Self {
        self.overrides.refetch_on_window_focus = Some(refetch);
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.overrides.refetch_on_reconnect = Some(refetch);
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.overrides.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.overrides.keep_previous_data = Some(keep);
        self
    }
}

impl<T, D> Clone for QueryOptions<T, D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetch_fn: self.fetch_fn.clone(),
            select: Arc::clone(&self.select),
            enabled: self.enabled,
            overrides: self.overrides.clone(),
        }
    }
}

impl<T, D> fmt::Debug for QueryOptions<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// What an observer exposes to its subscribers.
#[derive(Debug)]
pub struct QueryObserverResult<D> {
    pub status: QueryStatus,
    pub data: Option<Arc<D>>,
    pub error: Option<QueryError>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    /// Failed attempts of the current or last fetch.
    pub failure_count: u32,
    pub is_fetching: bool,
    /// The query has completed at least one fetch.
    pub is_fetched: bool,
    /// The query has completed a fetch since this observer subscribed.
    pub is_fetched_after_mount: bool,
    pub is_stale: bool,
    /// `data` belongs to the previous key while the current key loads.
    pub is_previous_data: bool,
    pub fetch_direction: Option<FetchDirection>,
}

impl<D> QueryObserverResult<D> {
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A background fetch is running while data is shown.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching && !self.is_loading()
    }

    /// The fetch failed before any data was stored.
    pub fn is_loading_error(&self) -> bool {
        self.is_error() && self.data_updated_at.is_none()
    }

    /// A refetch failed; stale data is still available.
    pub fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data_updated_at.is_some()
    }

    /// Compares flags by value and data by identity.
    pub fn shallow_eq(&self, other: &Self) -> bool {
        let same_data = match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_data
            && self.status == other.status
            && self.error == other.error
            && self.data_updated_at == other.data_updated_at
            && self.error_updated_at == other.error_updated_at
            && self.failure_count == other.failure_count
            && self.is_fetching == other.is_fetching
            && self.is_fetched == other.is_fetched
            && self.is_fetched_after_mount == other.is_fetched_after_mount
            && self.is_stale == other.is_stale
            && self.is_previous_data == other.is_previous_data
            && self.fetch_direction == other.fetch_direction
    }
}

impl<D> Default for QueryObserverResult<D> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            failure_count: 0,
            is_fetching: false,
            is_fetched: false,
            is_fetched_after_mount: false,
            is_stale: true,
            is_previous_data: false,
            fetch_direction: None,
        }
    }
}

impl<D> Clone for QueryObserverResult<D> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            is_fetching: self.is_fetching,
            is_fetched: self.is_fetched,
            is_fetched_after_mount: self.is_fetched_after_mount,
            is_stale: self.is_stale,
            is_previous_data: self.is_previous_data,
            fetch_direction: self.fetch_direction,
        }
    }
}

/// Options for [`QueryObserver::refetch_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Cancel a running fetch and start a new one, when the query already
    /// has data. Otherwise the running fetch is joined.
    pub cancel_refetch: bool,
}

struct SelectMemo<T, D> {
    input: Arc<T>,
    select: SelectFn<T, D>,
    output: Arc<D>,
}

struct ObserverState<T, D> {
    options: QueryOptions<T, D>,
    config: QueryConfig,
    query: Arc<Query<T>>,
    result: QueryObserverResult<D>,
    /// Last result of the previously observed query.
    previous_result: Option<QueryObserverResult<D>>,
    select_memo: Option<SelectMemo<T, D>>,
    mounted: bool,
    /// Data and error update counts when the observer mounted.
    mount_counts: (u32, u32),
    stale_timer: Option<JoinHandle<()>>,
    interval: Option<CancellationToken>,
}

impl<T, D> ObserverState<T, D> {
    fn clear_timers(&mut self) {
        if let Some(timer) = self.stale_timer.take() {
            timer.abort();
        }
        if let Some(token) = self.interval.take() {
            token.cancel();
        }
    }
}

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ObserverInner<T, D> {
    id: u64,
    client: QueryClient,
    weak_self: Weak<Self>,
    state: Mutex<ObserverState<T, D>>,
    listeners: Listeners<QueryObserverResult<D>>,
    results: watch::Sender<QueryObserverResult<D>>,
}

impl<T, D> ObserverInner<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn listener(&self) -> Option<Arc<dyn QueryListener<T>>> {
        self.weak_self
            .upgrade()
            .map(|inner| inner as Arc<dyn QueryListener<T>>)
    }

    /// Binds to a fresh query if the current one was removed from the cache.
    /// Returns `true` when it rebound.
    fn ensure_query(&self, st: &mut ObserverState<T, D>) -> Result<bool, QueryError> {
        if !st.query.is_removed() {
            return Ok(false);
        }
        let query = self.client.cache().build(
            st.options.key.clone(),
            st.options.fetch_fn.clone(),
            st.config.clone(),
        )?;
        trace!(key = %st.options.key, "observer rebound to a new query");
        if st.mounted
            && let Some(listener) = self.listener()
        {
            query.add_observer(listener);
        }
        st.mount_counts = update_counts(&query.state());
        st.query = query;
        Ok(true)
    }

    fn execute_fetch(&self, options: FetchOptions<T>) -> Result<SharedFetch<T>, QueryError> {
        let (query, rebound) = {
            let mut st = self.state.lock();
            let rebound = self.ensure_query(&mut st)?;
            (st.query.clone(), rebound)
        };
        let fetch = query.fetch(options);
        if rebound {
            // removal cleared the timers of the old query
            self.update_timers();
        }
        Ok(fetch)
    }

    /// Data of the bound query, `None` once it was removed.
    fn query_data(&self) -> Option<Arc<T>> {
        let st = self.state.lock();
        if st.query.is_removed() {
            return None;
        }
        st.query.data()
    }

    fn create_result(st: &mut ObserverState<T, D>) -> QueryObserverResult<D> {
        if st.query.is_removed() {
            return QueryObserverResult::default();
        }
        let state = st.query.state();
        let counts = update_counts(&state);
        let mut result = QueryObserverResult {
            status: state.status,
            data: None,
            error: state.error.clone(),
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            is_fetching: state.is_fetching,
            is_fetched: counts != (0, 0),
            is_fetched_after_mount: counts.0 > st.mount_counts.0 || counts.1 > st.mount_counts.1,
            is_stale: state.is_stale_by_time(st.config.stale_time),
            is_previous_data: false,
            fetch_direction: state.fetch_direction,
        };

        let keep_previous = st.config.keep_previous_data
            && state.data_updated_at.is_none()
            && state.status != QueryStatus::Error;
        match (&st.previous_result, &state.data) {
            (Some(previous), _) if keep_previous && previous.is_success() => {
                result.status = previous.status;
                result.data = previous.data.clone();
                result.data_updated_at = previous.data_updated_at;
                result.is_previous_data = true;
            }
            (_, Some(data)) => {
                result.data = Some(select_memoized(&mut st.select_memo, &st.options.select, data));
            }
            _ => {}
        }
        result
    }

    fn update_result(&self) {
        let next = {
            let mut st = self.state.lock();
            let next = Self::create_result(&mut st);
            if next.shallow_eq(&st.result) {
                return;
            }
            st.result = next.clone();
            self.schedule_stale_timer(&mut st);
            next
        };
        self.publish(&next);
    }

    fn publish(&self, result: &QueryObserverResult<D>) {
        self.results.send_replace(result.clone());
        self.listeners.emit(result);
    }

    /// Re-evaluates the result once the data turns stale.
    fn schedule_stale_timer(&self, st: &mut ObserverState<T, D>) {
        if let Some(timer) = st.stale_timer.take() {
            timer.abort();
        }
        if !st.mounted || st.result.is_stale {
            return;
        }
        let Some(stale_at) = st
            .result
            .data_updated_at
            .and_then(|updated_at| updated_at.checked_add(st.config.stale_time))
        else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = self.weak_self.clone();
        st.stale_timer = Some(handle.spawn(async move {
            tokio::time::sleep_until(stale_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.update_result();
            }
        }));
    }

    fn schedule_interval(&self, st: &mut ObserverState<T, D>) {
        if let Some(token) = st.interval.take() {
            token.cancel();
        }
        let Some(period) = st.config.refetch_interval else {
            return;
        };
        if !st.mounted || !st.options.enabled || period.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let token = CancellationToken::new();
        let stop = token.clone();
        let weak = self.weak_self.clone();
        handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = std::pin::pin!(
                IntervalStream::new(ticker)
                    .skip(1) // the first tick is immediate
                    .take_until(stop.cancelled_owned())
            );
            while ticks.next().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.execute_fetch(FetchOptions::default()) {
                    warn!(error = %e, "interval refetch failed to start");
                }
            }
        });
        st.interval = Some(token);
    }

    fn update_timers(&self) {
        let mut st = self.state.lock();
        self.schedule_stale_timer(&mut st);
        self.schedule_interval(&mut st);
    }

    fn mount(&self) {
        let (query, should_fetch) = {
            let mut st = self.state.lock();
            if let Err(e) = self.ensure_query(&mut st) {
                warn!(key = %st.options.key, error = %e, "observer could not bind its query");
            }
            st.mounted = true;
            let state = st.query.state();
            st.mount_counts = update_counts(&state);
            let should_fetch = st.options.enabled
                && (state.data_updated_at.is_none()
                    || (st.config.refetch_on_mount && state.is_stale_by_time(st.config.stale_time)));
            (st.query.clone(), should_fetch)
        };
        if let Some(listener) = self.listener() {
            query.add_observer(listener);
        }
        self.update_result();
        if should_fetch {
            let _ = query.fetch(FetchOptions::default());
        }
        self.update_timers();
    }

    fn unmount(&self) {
        let query = {
            let mut st = self.state.lock();
            if !st.mounted {
                return;
            }
            st.mounted = false;
            st.clear_timers();
            st.query.clone()
        };
        query.remove_observer(self.id);
    }

    fn on_removed(&self) {
        let result = {
            let mut st = self.state.lock();
            st.clear_timers();
            st.select_memo = None;
            st.previous_result = None;
            st.result = QueryObserverResult::default();
            st.result.clone()
        };
        trace!(observer = self.id, "observed query was removed");
        self.publish(&result);
    }
}

impl<T, D> QueryListener<T> for ObserverInner<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn listener_id(&self) -> u64 {
        self.id
    }

    fn on_query_update(&self, event: QueryEvent) {
        match event {
            QueryEvent::Updated => self.update_result(),
            QueryEvent::Removed => self.on_removed(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().options.enabled
    }

    fn is_stale(&self) -> bool {
        let st = self.state.lock();
        st.options.enabled && st.query.state().is_stale_by_time(st.config.stale_time)
    }

    fn refetch_on(&self, trigger: RefetchTrigger) -> bool {
        let should_refetch = {
            let st = self.state.lock();
            let wanted = match trigger {
                RefetchTrigger::WindowFocus => st.config.refetch_on_window_focus,
                RefetchTrigger::Reconnect => st.config.refetch_on_reconnect,
            };
            wanted && st.options.enabled && st.query.state().is_stale_by_time(st.config.stale_time)
        };
        if !should_refetch {
            return false;
        }
        match self.execute_fetch(FetchOptions::default()) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, ?trigger, "refetch failed to start");
                false
            }
        }
    }
}

fn update_counts<T>(state: &QueryState<T>) -> (u32, u32) {
    (state.data_update_count, state.error_update_count)
}

fn select_memoized<T, D>(
    memo: &mut Option<SelectMemo<T, D>>,
    select: &SelectFn<T, D>,
    data: &Arc<T>,
) -> Arc<D> {
    if let Some(m) = memo.as_ref()
        && Arc::ptr_eq(&m.input, data)
        && std::ptr::addr_eq(Arc::as_ptr(&m.select), Arc::as_ptr(select))
    {
        return m.output.clone();
    }
    let output = select(data);
    *memo = Some(SelectMemo {
        input: data.clone(),
        select: select.clone(),
        output: output.clone(),
    });
    output
}

/// Watches one query on behalf of one consumer.
///
/// The observer mounts when its first subscriber arrives: it attaches to the
/// query and fetches if the query has no data, or stale data and
/// `refetch_on_mount` is set. It unmounts when the last subscriber leaves.
pub struct QueryObserver<T, D = T> {
    inner: Arc<ObserverInner<T, D>>,
}

impl<T, D> QueryObserver<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Creates an observer bound to the query for `options.key`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key caches another type.
    pub fn new(client: &QueryClient, options: QueryOptions<T, D>) -> Result<Self, QueryError> {
        let config = client.resolve(&options.overrides);
        let query = client
            .cache()
            .build(options.key.clone(), options.fetch_fn.clone(), config.clone())?;
        let mount_counts = update_counts(&query.state());
        let (results, _) = watch::channel(QueryObserverResult::default());

        let inner = Arc::new_cyclic(|weak_self| ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            weak_self: weak_self.clone(),
            state: Mutex::new(ObserverState {
                options,
                config,
                query,
                result: QueryObserverResult::default(),
                previous_result: None,
                select_memo: None,
                mounted: false,
                mount_counts,
                stale_timer: None,
                interval: None,
            }),
            listeners: Listeners::new(),
            results,
        });
        inner.update_result();
        Ok(Self { inner })
    }

    pub fn get_current_result(&self) -> QueryObserverResult<D> {
        self.inner.state.lock().result.clone()
    }

    pub fn options(&self) -> QueryOptions<T, D> {
        self.inner.state.lock().options.clone()
    }

    /// Registers `callback` for result changes.
    ///
    /// The first subscriber mounts the observer. Dropping the returned
    /// [`Subscription`] unsubscribes; the last one to leave unmounts.
    pub fn subscribe(
        &self,
        callback: impl Fn(&QueryObserverResult<D>) + Send + Sync + 'static,
    ) -> Subscription {
        let (id, first) = self.inner.listeners.add(callback);
        if first {
            self.inner.mount();
        }
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade()
                && inner.listeners.remove(id)
            {
                inner.unmount();
            }
        })
    }

    /// A stream of results, starting with the current one.
    ///
    /// The stream counts as a subscriber for as long as it is alive.
    pub fn stream(&self) -> BoxStream<'static, QueryObserverResult<D>> {
        let subscription = self.subscribe(|_| {});
        WatchStream::new(self.inner.results.subscribe())
            .map(move |result| {
                let _mounted = &subscription;
                result
            })
            .boxed()
    }

    /// Replaces the options.
    ///
    /// A new key switches the observer to that key's query, fetching when
    /// mounted and the data is stale. With `keep_previous_data` the old data
    /// stays visible until the new query succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the new key caches another type.
    pub fn set_options(&self, options: QueryOptions<T, D>) -> Result<(), QueryError> {
        let inner = &self.inner;
        let config = inner.client.resolve(&options.overrides);
        let fetch_query = {
            let mut st = inner.state.lock();
            let key_changed = st.options.key != options.key || st.query.is_removed();
            let enabled_now = options.enabled && !st.options.enabled;

            if key_changed {
                let query = inner.client.cache().build(
                    options.key.clone(),
                    options.fetch_fn.clone(),
                    config.clone(),
                )?;
                if st.mounted {
                    if !st.query.is_removed() {
                        st.query.remove_observer(inner.id);
                    }
                    if let Some(listener) = inner.listener() {
                        query.add_observer(listener);
                    }
                }
                trace!(from = %st.options.key, to = %options.key, "observer switched query");
                st.previous_result = Some(st.result.clone());
                st.mount_counts = update_counts(&query.state());
                st.query = query;
            } else {
                st.query.set_options(options.fetch_fn.clone(), config.clone());
            }

            let should_fetch = st.mounted
                && options.enabled
                && (key_changed || enabled_now)
                && st.query.state().is_stale_by_time(config.stale_time);
            st.options = options;
            st.config = config;
            should_fetch.then(|| st.query.clone())
        };

        inner.update_result();
        if let Some(query) = fetch_query {
            let _ = query.fetch(FetchOptions::default());
        }
        inner.update_timers();
        Ok(())
    }

    /// Fetches now and returns the settled result. A fetch already running
    /// on the query is joined.
    pub async fn refetch(&self) -> QueryObserverResult<D> {
        self.refetch_with(RefetchOptions::default()).await
    }

    /// [`QueryObserver::refetch`] with explicit options.
    pub async fn refetch_with(&self, options: RefetchOptions) -> QueryObserverResult<D> {
        let fetch = self.inner.execute_fetch(FetchOptions {
            cancel_refetch: options.cancel_refetch,
            ..FetchOptions::default()
        });
        match fetch {
            Ok(fetch) => {
                // failures are reported through the result
                let _ = fetch.await;
            }
            Err(e) => warn!(error = %e, "refetch failed to start"),
        }
        self.inner.update_result();
        self.get_current_result()
    }

    /// Fetches the query for `options` and returns the result it would
    /// produce, without switching this observer.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key caches another type.
    pub async fn fetch_optimistic(
        &self,
        options: QueryOptions<T, D>,
    ) -> Result<QueryObserverResult<D>, QueryError> {
        let config = self.inner.client.resolve(&options.overrides);
        let query = self.inner.client.cache().build(
            options.key.clone(),
            options.fetch_fn.clone(),
            config.clone(),
        )?;
        // failures are reported through the result
        let _ = query.fetch(FetchOptions::default()).await;

        let mut scratch = ObserverState {
            mount_counts: (0, 0),
            options,
            config,
            query,
            result: QueryObserverResult::default(),
            previous_result: None,
            select_memo: None,
            mounted: false,
            stale_timer: None,
            interval: None,
        };
        Ok(ObserverInner::create_result(&mut scratch))
    }

    /// Unsubscribes everyone and detaches from the query.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        self.inner.unmount();
    }

    /// Runs a fetch on the observed query with explicit fetch options.
    pub(crate) fn fetch_with(&self, options: FetchOptions<T>) -> Result<SharedFetch<T>, QueryError> {
        self.inner.execute_fetch(options)
    }

    pub(crate) fn update_result(&self) {
        self.inner.update_result();
    }

    /// Reads the bound query's data without keeping the observer alive.
    pub(crate) fn query_data_source(&self) -> impl Fn() -> Option<Arc<T>> + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move || weak.upgrade().and_then(|inner| inner.query_data())
    }

    pub(crate) fn query_data(&self) -> Option<Arc<T>> {
        self.inner.query_data()
    }
}

impl<T, D> fmt::Debug for QueryObserver<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("subscribers", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryFilters;
    use crate::key::KeyValue;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(key: &str, calls: Arc<AtomicUsize>, delay: Duration) -> QueryOptions<usize> {
        QueryOptions::new(key, move |_ctx: QueryFnContext| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok::<_, QueryError>(n)
            }
            .boxed()
        })
    }

    fn item(id: i32) -> QueryOptions<String> {
        let key = QueryKey::new(vec!["items".into(), KeyValue::from(id)]).expect("key should hash");
        QueryOptions::new(key, move |_ctx: QueryFnContext| {
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, QueryError>(format!("item {id}"))
            }
            .boxed()
        })
        .keep_previous_data(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_fetches_and_notifies() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("todos", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");
        assert!(observer.get_current_result().is_idle());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = observer.subscribe(move |result| s.lock().push(result.status));
        assert!(observer.get_current_result().is_loading());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = observer.get_current_result();
        assert!(result.is_success());
        assert_eq!(result.data.as_deref(), Some(&1));
        assert!(result.is_fetched_after_mount);
        assert_eq!(*seen.lock(), vec![QueryStatus::Loading, QueryStatus::Success]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_called_in_order() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("todos", calls, Duration::from_millis(10)))
            .expect("observer should build");

        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                observer.subscribe(move |_| order.lock().push(i))
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().clear();
        observer.refetch().await;

        let order = order.lock().clone();
        assert!(!order.is_empty());
        for chunk in order.chunks(3) {
            assert_eq!(chunk, [0, 1, 2]);
        }
        drop(subs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_share_one_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("shared", calls.clone(), Duration::from_millis(10));
        let a = QueryObserver::new(&client, options.clone()).expect("observer should build");
        let b = QueryObserver::new(&client, options).expect("observer should build");

        let _sa = a.subscribe(|_| {});
        let _sb = b.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            a.get_current_result().data.as_ref().expect("a has data"),
            b.get_current_result().data.as_ref().expect("b has data"),
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_observer_waits_until_enabled() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("lazy", calls.clone(), Duration::from_millis(10));
        let observer = QueryObserver::new(&client, options.clone().enabled(false))
            .expect("observer should build");

        let _sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(observer.get_current_result().is_idle());

        observer.set_options(options).expect("options should apply");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observer.get_current_result().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_is_memoized() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let selects = Arc::new(AtomicUsize::new(0));
        let counter = selects.clone();
        let options = counting("selected", calls, Duration::from_millis(10)).select(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            n * 10
        });
        let observer = QueryObserver::new(&client, options).expect("observer should build");
        let _sub = observer.subscribe(|_| {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.get_current_result().data.as_deref(), Some(&10));
        assert_eq!(selects.load(Ordering::SeqCst), 1);

        let result = observer.refetch().await;
        assert_eq!(result.data.as_deref(), Some(&20));
        assert_eq!(selects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_previous_data_across_key_change() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(&client, item(1)).expect("observer should build");
        let _sub = observer.subscribe(|_| {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.get_current_result().data.as_deref().map(String::as_str), Some("item 1"));

        observer.set_options(item(2)).expect("options should apply");
        let result = observer.get_current_result();
        assert!(result.is_success());
        assert!(result.is_fetching);
        assert!(result.is_previous_data);
        assert_eq!(result.data.as_deref().map(String::as_str), Some("item 1"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = observer.get_current_result();
        assert!(!result.is_previous_data);
        assert_eq!(result.data.as_deref().map(String::as_str), Some("item 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_change_without_keep_previous_data_loads() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(&client, item(1).keep_previous_data(false))
            .expect("observer should build");
        let _sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        observer
            .set_options(item(2).keep_previous_data(false))
            .expect("options should apply");
        let result = observer.get_current_result();
        assert!(result.is_loading());
        assert!(result.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_flips_is_stale() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("fresh", calls, Duration::from_millis(10)).stale_time(Duration::from_millis(100));
        let observer = QueryObserver::new(&client, options).expect("observer should build");
        let _sub = observer.subscribe(|_| {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!observer.get_current_result().is_stale);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observer.get_current_result().is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("polled", calls.clone(), Duration::from_millis(1))
            .refetch_interval(Some(Duration::from_secs(1)));
        let observer = QueryObserver::new(&client, options).expect("observer should build");
        let sub = observer.subscribe(|_| {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval_resumes_after_removal() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("repolled", calls.clone(), Duration::from_millis(1))
            .refetch_interval(Some(Duration::from_secs(1)));
        let observer = QueryObserver::new(&client, options).expect("observer should build");
        let _sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.remove_queries(&QueryFilters::exact("repolled"));
        observer.refetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refetches_join() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = QueryObserver::new(&client, counting("joined", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");
        let b = QueryObserver::new(&client, counting("joined", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");
        let _a = a.subscribe(|_| {});
        let _b = b.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (ra, rb) = tokio::join!(a.refetch(), b.refetch());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ra.data.as_deref(), Some(&2));
        assert_eq!(rb.data.as_deref(), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_with_cancel_restarts() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("restarted", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");
        let _sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        let restart = RefetchOptions { cancel_refetch: true };
        let (_, result) = tokio::join!(observer.refetch(), observer.refetch_with(restart));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.data.as_deref(), Some(&3));
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_refetches_only_stale_queries() {
        let client = QueryClient::new();
        let stale_calls = Arc::new(AtomicUsize::new(0));
        let fresh_calls = Arc::new(AtomicUsize::new(0));
        let stale = QueryObserver::new(&client, counting("stale", stale_calls.clone(), Duration::from_millis(1)))
            .expect("observer should build");
        let fresh = QueryObserver::new(
            &client,
            counting("fresh", fresh_calls.clone(), Duration::from_millis(1)).stale_time(Duration::from_secs(60)),
        )
        .expect("observer should build");
        let _a = stale.subscribe(|_| {});
        let _b = fresh.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.on_focus();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stale_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_surfaces_in_result() {
        let client = QueryClient::new();
        let options: QueryOptions<usize> =
            QueryOptions::new("broken", |_ctx: QueryFnContext| async { Err::<usize, _>(QueryError::fetch("boom")) }.boxed())
                .retry(false);
        let observer = QueryObserver::new(&client, options).expect("observer should build");
        let _sub = observer.subscribe(|_| {});

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = observer.get_current_result();
        assert!(result.is_error());
        assert!(result.is_loading_error());
        assert!(!result.is_refetch_error());
        assert_eq!(result.error, Some(QueryError::fetch("boom")));
        assert_eq!(result.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_resets_and_rebinds() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("doomed", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");
        let _sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observer.get_current_result().is_success());

        client.remove_queries(&QueryFilters::exact("doomed"));
        let result = observer.get_current_result();
        assert!(result.is_idle());
        assert!(result.data.is_none());

        let result = observer.refetch().await;
        assert_eq!(result.data.as_deref(), Some(&2));
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_yields_results() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("streamed", calls, Duration::from_millis(10)))
            .expect("observer should build");

        let mut stream = observer.stream();
        let mut last = None;
        while let Some(result) = stream.next().await {
            if result.is_success() {
                last = Some(result);
                break;
            }
        }
        assert_eq!(last.and_then(|r| r.data).as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_optimistic_leaves_observer_alone() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("current", calls.clone(), Duration::from_millis(10)))
            .expect("observer should build");

        let other = counting("other", calls, Duration::from_millis(10));
        let result = observer.fetch_optimistic(other).await.expect("fetch should run");
        assert_eq!(result.data.as_deref(), Some(&1));
        assert!(observer.get_current_result().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_detaches() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("gone", calls, Duration::from_millis(10)))
            .expect("observer should build");
        let sub = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        let query = client.cache().find(&QueryFilters::exact("gone")).expect("query exists");
        assert_eq!(query.observer_count(), 1);
        observer.destroy();
        assert_eq!(query.observer_count(), 0);
        sub.detach();
    }
}
