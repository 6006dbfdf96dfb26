//! Infinite (paginated) queries.
//!
//! An infinite query caches an [`InfiniteData`]: the pages fetched so far and
//! the param each page was fetched with. Both lists always have the same
//! length. [`InfiniteQueryObserver::fetch_next_page`] appends a page and
//! [`InfiniteQueryObserver::fetch_previous_page`] prepends one; a full refetch
//! re-fetches every page one after another, in order, each with its stored
//! param.
//!
//! A `select` transform may reshape the pages an observer exposes. It maps an
//! [`InfiniteData`] to another [`InfiniteData`], so the exposed pages stay
//! paired with their params.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::client::QueryClient;
use crate::config::QueryOverrides;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::{QueryObserver, QueryObserverResult, QueryOptions, RefetchOptions, SelectFn};
use crate::query::{FetchContext, FetchDirection, FetchFn, FetchOptions};
use crate::retryer::{Retry, RetryDelay};
use crate::subscription::Subscription;

/// Pages of an infinite query and the params they were fetched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteData<P, Page> {
    pages: Vec<Page>,
    page_params: Vec<P>,
}

impl<P, Page> InfiniteData<P, Page> {
    /// # Errors
    ///
    /// Returns [`QueryError::PageMismatch`] unless both lists have the same length.
    pub fn new(pages: Vec<Page>, page_params: Vec<P>) -> Result<Self, QueryError> {
        if pages.len() != page_params.len() {
            return Err(QueryError::PageMismatch {
                pages: pages.len(),
                page_params: page_params.len(),
            });
        }
        Ok(Self { pages, page_params })
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page_params(&self) -> &[P] {
        &self.page_params
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn push_back(&mut self, page_param: P, page: Page) {
        self.page_params.push(page_param);
        self.pages.push(page);
    }

    pub fn push_front(&mut self, page_param: P, page: Page) {
        self.page_params.insert(0, page_param);
        self.pages.insert(0, page);
    }

    pub fn into_parts(self) -> (Vec<Page>, Vec<P>) {
        (self.pages, self.page_params)
    }

    /// Maps every page, keeping its param.
    pub fn map_pages<E>(&self, f: impl FnMut(&Page) -> E) -> InfiniteData<P, E>
    where
        P: Clone,
    {
        InfiniteData {
            pages: self.pages.iter().map(f).collect(),
            page_params: self.page_params.clone(),
        }
    }
}

impl<P, Page> Default for InfiniteData<P, Page> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

/// Context passed to a page fetch function.
#[derive(Debug, Clone)]
pub struct PageFnContext<P> {
    pub query_key: QueryKey,
    pub page_param: P,
    pub signal: CancellationToken,
    /// `None` for the first page and for refetches.
    pub direction: Option<FetchDirection>,
}

/// Fetches one page.
pub type PageFn<P, Page> =
    Arc<dyn Fn(PageFnContext<P>) -> BoxFuture<'static, Result<Page, QueryError>> + Send + Sync>;

/// Computes the param of an adjacent page from the edge page and all pages.
/// `None` means there is no such page.
pub type GetPageParam<P, Page> = Arc<dyn Fn(&Page, &[Page]) -> Option<P> + Send + Sync>;

/// Chooses the pages a refetch re-fetches, by page, index and all pages.
pub type RefetchPage<Page> = Arc<dyn Fn(&Page, usize, &[Page]) -> bool + Send + Sync>;

#[derive(Clone)]
enum FetchMode<P, Page> {
    Refetch(Option<RefetchPage<Page>>),
    Next(Option<P>),
    Previous(Option<P>),
}

/// The page-level half of an infinite query's options.
#[derive(Clone)]
struct PageFetcher<P, Page> {
    page_fn: PageFn<P, Page>,
    initial_page_param: P,
    get_next_page_param: GetPageParam<P, Page>,
    get_previous_page_param: Option<GetPageParam<P, Page>>,
}

impl<P, Page> PageFetcher<P, Page>
where
    P: Clone + Send + Sync + 'static,
    Page: Clone + Send + Sync + 'static,
{
    fn next_param(&self, data: &InfiniteData<P, Page>) -> Option<P> {
        let last = data.pages.last()?;
        (self.get_next_page_param)(last, &data.pages)
    }

    fn previous_param(&self, data: &InfiniteData<P, Page>) -> Option<P> {
        let first = data.pages.first()?;
        let get = self.get_previous_page_param.as_ref()?;
        get(first, &data.pages)
    }

    fn fetch_fn(&self, mode: FetchMode<P, Page>) -> FetchFn<InfiniteData<P, Page>> {
        let fetcher = self.clone();
        Arc::new(move |ctx: FetchContext<InfiniteData<P, Page>>| {
            let fetcher = fetcher.clone();
            let mode = mode.clone();
            async move { fetcher.run(ctx, mode).await }.boxed()
        })
    }

    async fn fetch_page(
        &self,
        ctx: &FetchContext<InfiniteData<P, Page>>,
        page_param: P,
        direction: Option<FetchDirection>,
    ) -> Result<Page, QueryError> {
        (self.page_fn)(PageFnContext {
            query_key: ctx.query_key.clone(),
            page_param,
            signal: ctx.signal.clone(),
            direction,
        })
        .await
    }

    async fn run(
        self,
        ctx: FetchContext<InfiniteData<P, Page>>,
        mode: FetchMode<P, Page>,
    ) -> Result<InfiniteData<P, Page>, QueryError> {
        let mut data = ctx.data.as_deref().cloned().unwrap_or_default();
        if data.is_empty() {
            let param = self.initial_page_param.clone();
            let page = self.fetch_page(&ctx, param.clone(), None).await?;
            data.push_back(param, page);
            return Ok(data);
        }

        match mode {
            FetchMode::Refetch(refetch_page) => self.refetch(&ctx, data, refetch_page).await,
            FetchMode::Next(custom) => {
                let Some(param) = custom.or_else(|| self.next_param(&data)) else {
                    return Ok(data);
                };
                let page = self
                    .fetch_page(&ctx, param.clone(), Some(FetchDirection::Forward))
                    .await?;
                data.push_back(param, page);
                Ok(data)
            }
            FetchMode::Previous(custom) => {
                let Some(param) = custom.or_else(|| self.previous_param(&data)) else {
                    return Ok(data);
                };
                let page = self
                    .fetch_page(&ctx, param.clone(), Some(FetchDirection::Backward))
                    .await?;
                data.push_front(param, page);
                Ok(data)
            }
        }
    }

    /// Re-fetches pages strictly one after another.
    async fn refetch(
        &self,
        ctx: &FetchContext<InfiniteData<P, Page>>,
        old: InfiniteData<P, Page>,
        refetch_page: Option<RefetchPage<Page>>,
    ) -> Result<InfiniteData<P, Page>, QueryError> {
        let mut data = InfiniteData::default();
        for (index, (page, param)) in old.pages.iter().zip(&old.page_params).enumerate() {
            let wanted = refetch_page
                .as_ref()
                .is_none_or(|f| f(page, index, &old.pages));
            let page = if wanted {
                self.fetch_page(ctx, param.clone(), None).await?
            } else {
                page.clone()
            };
            data.push_back(param.clone(), page);
        }
        trace!(key = %ctx.query_key, pages = data.len(), "pages refetched");
        Ok(data)
    }
}

/// Options for an infinite query.
///
/// `Page` is what the page function returns and the cache stores; `Out` is
/// the page type observers expose, `Page` unless
/// [`InfiniteQueryOptions::select`] is used.
pub struct InfiniteQueryOptions<P, Page, Out = Page> {
    pub key: QueryKey,
    pub page_fn: PageFn<P, Page>,
    /// Param of the first page.
    pub initial_page_param: P,
    pub get_next_page_param: GetPageParam<P, Page>,
    pub get_previous_page_param: Option<GetPageParam<P, Page>>,
    pub select: SelectFn<InfiniteData<P, Page>, InfiniteData<P, Out>>,
    pub enabled: bool,
    pub overrides: QueryOverrides,
}

impl<P, Page> InfiniteQueryOptions<P, Page>
where
    P: Clone + Send + Sync + 'static,
    Page: Clone + Send + Sync + 'static,
{
    pub fn new<F, G>(key: impl Into<QueryKey>, initial_page_param: P, page_fn: F, get_next_page_param: G) -> Self
    where
        F: Fn(PageFnContext<P>) -> BoxFuture<'static, Result<Page, QueryError>> + Send + Sync + 'static,
        G: Fn(&Page, &[Page]) -> Option<P> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            page_fn: Arc::new(page_fn),
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            get_previous_page_param: None,
            select: Arc::new(|data: &Arc<InfiniteData<P, Page>>| Arc::clone(data)),
            enabled: true,
            overrides: QueryOverrides::default(),
        }
    }
}

impl<P, Page, Out> InfiniteQueryOptions<P, Page, Out>
where
    P: Clone + Send + Sync + 'static,
    Page: Clone + Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// Exposes `f(data)` instead of the cached pages.
    ///
    /// The transform runs again only when the cached pages change. Page
    /// fetching and `has_next_page` always work on the cached pages.
    pub fn select<E>(
        self,
        f: impl Fn(&InfiniteData<P, Page>) -> InfiniteData<P, E> + Send + Sync + 'static,
    ) -> InfiniteQueryOptions<P, Page, E>
    where
        E: Send + Sync + 'static,
    {
        InfiniteQueryOptions {
            key: self.key,
            page_fn: self.page_fn,
            initial_page_param: self.initial_page_param,
            get_next_page_param: self.get_next_page_param,
            get_previous_page_param: self.get_previous_page_param,
            select: Arc::new(move |data: &Arc<InfiniteData<P, Page>>| Arc::new(f(data.as_ref()))),
            enabled: self.enabled,
            overrides: self.overrides,
        }
    }

    #[must_use]
    pub fn get_previous_page_param(
        mut self,
        f: impl Fn(&Page, &[Page]) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        self.get_previous_page_param = Some(Arc::new(f));
        self
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
    pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.overrides.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.overrides.keep_previous_data = Some(keep);
        self
    }

    fn fetcher(&self) -> PageFetcher<P, Page> {
        PageFetcher {
            page_fn: self.page_fn.clone(),
            initial_page_param: self.initial_page_param.clone(),
            get_next_page_param: self.get_next_page_param.clone(),
            get_previous_page_param: self.get_previous_page_param.clone(),
        }
    }

    /// The plain query options whose fetch function performs a full refetch.
    pub fn to_query_options(&self) -> QueryOptions<InfiniteData<P, Page>, InfiniteData<P, Out>> {
        QueryOptions {
            key: self.key.clone(),
            fetch_fn: Some(self.fetcher().fetch_fn(FetchMode::Refetch(None))),
            select: self.select.clone(),
            enabled: self.enabled,
            overrides: self.overrides.clone(),
        }
    }
}

impl<P: Clone, Page, Out> Clone for InfiniteQueryOptions<P, Page, Out> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            page_fn: self.page_fn.clone(),
            initial_page_param: self.initial_page_param.clone(),
            get_next_page_param: self.get_next_page_param.clone(),
            get_previous_page_param: self.get_previous_page_param.clone(),
            select: self.select.clone(),
            enabled: self.enabled,
            overrides: self.overrides.clone(),
        }
    }
}

impl<P, Page, Out> fmt::Debug for InfiniteQueryOptions<P, Page, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// Result of an infinite query observer.
///
/// Dereferences to the underlying [`QueryObserverResult`].
#[derive(Debug)]
pub struct InfiniteQueryObserverResult<P, Page> {
    pub result: QueryObserverResult<InfiniteData<P, Page>>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub is_fetching_next_page: bool,
    pub is_fetching_previous_page: bool,
}

impl<P, Page> InfiniteQueryObserverResult<P, Page> {
    /// The pages, empty before the first page arrives.
    pub fn pages(&self) -> &[Page] {
        self.result.data.as_deref().map(InfiniteData::pages).unwrap_or_default()
    }

    pub fn page_params(&self) -> &[P] {
        self.result.data.as_deref().map(InfiniteData::page_params).unwrap_or_default()
    }
}

impl<P, Page> Deref for InfiniteQueryObserverResult<P, Page> {
    type Target = QueryObserverResult<InfiniteData<P, Page>>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl<P, Page> Clone for InfiniteQueryObserverResult<P, Page> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            has_next_page: self.has_next_page,
            has_previous_page: self.has_previous_page,
            is_fetching_next_page: self.is_fetching_next_page,
            is_fetching_previous_page: self.is_fetching_previous_page,
        }
    }
}

/// Adds the paging flags, computed from the cached pages in `cached`.
fn decorate<P, Page, Out>(
    fetcher: &PageFetcher<P, Page>,
    cached: Option<&InfiniteData<P, Page>>,
    result: QueryObserverResult<InfiniteData<P, Out>>,
) -> InfiniteQueryObserverResult<P, Out>
where
    P: Clone + Send + Sync + 'static,
    Page: Clone + Send + Sync + 'static,
{
    let (has_next_page, has_previous_page) = cached.map_or((false, false), |data| {
        (fetcher.next_param(data).is_some(), fetcher.previous_param(data).is_some())
    });
    InfiniteQueryObserverResult {
        has_next_page,
        has_previous_page,
        is_fetching_next_page: result.is_fetching
            && result.fetch_direction == Some(FetchDirection::Forward),
        is_fetching_previous_page: result.is_fetching
            && result.fetch_direction == Some(FetchDirection::Backward),
        result,
    }
}

/// Observes an infinite query.
pub struct InfiniteQueryObserver<P, Page, Out = Page> {
    observer: QueryObserver<InfiniteData<P, Page>, InfiniteData<P, Out>>,
    fetcher: Arc<Mutex<PageFetcher<P, Page>>>,
}

impl<P, Page, Out> InfiniteQueryObserver<P, Page, Out>
where
    P: Clone + Send + Sync + 'static,
    Page: Clone + Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key caches another type.
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<P, Page, Out>) -> Result<Self, QueryError> {
        let observer = QueryObserver::new(client, options.to_query_options())?;
        Ok(Self {
            observer,
            fetcher: Arc::new(Mutex::new(options.fetcher())),
        })
    }

    fn fetcher(&self) -> PageFetcher<P, Page> {
        self.fetcher.lock().clone()
    }

    pub fn get_current_result(&self) -> InfiniteQueryObserverResult<P, Out> {
        let cached = self.observer.query_data();
        decorate(&self.fetcher(), cached.as_deref(), self.observer.get_current_result())
    }

    /// See [`QueryObserver::subscribe`].
    pub fn subscribe(
        &self,
        callback: impl Fn(&InfiniteQueryObserverResult<P, Out>) + Send + Sync + 'static,
    ) -> Subscription {
        let fetcher = self.fetcher.clone();
        let cached = self.observer.query_data_source();
        self.observer.subscribe(move |result| {
            let fetcher = fetcher.lock().clone();
            callback(&decorate(&fetcher, cached().as_deref(), result.clone()));
        })
    }

    pub fn stream(&self) -> BoxStream<'static, InfiniteQueryObserverResult<P, Out>> {
        let fetcher = self.fetcher.clone();
        let cached = self.observer.query_data_source();
        self.observer
            .stream()
            .map(move |result| {
                let fetcher = fetcher.lock().clone();
                decorate(&fetcher, cached().as_deref(), result)
            })
            .boxed()
    }

    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the new key caches another type.
    pub fn set_options(&self, options: InfiniteQueryOptions<P, Page, Out>) -> Result<(), QueryError> {
        *self.fetcher.lock() = options.fetcher();
        self.observer.set_options(options.to_query_options())
    }

    /// Appends the next page.
    ///
    /// Without `page_param` the param comes from `get_next_page_param`; when
    /// that yields `None` nothing is fetched. While another fetch runs on the
    /// query, such as a full refetch, the call joins it and returns its
    /// result without adding a page.
    pub async fn fetch_next_page(&self, page_param: Option<P>) -> InfiniteQueryObserverResult<P, Out> {
        if page_param.is_none()
            && let Some(cached) = self.observer.query_data()
            && !cached.is_empty()
            && self.fetcher().next_param(&cached).is_none()
        {
            trace!("no next page");
            return self.get_current_result();
        }
        let fetch_fn = self.fetcher().fetch_fn(FetchMode::Next(page_param));
        self.run(FetchOptions {
            cancel_refetch: false,
            direction: Some(FetchDirection::Forward),
            fetch_fn: Some(fetch_fn),
        })
        .await
    }

    /// Prepends the previous page. The counterpart of
    /// [`InfiniteQueryObserver::fetch_next_page`], joining a running fetch the
    /// same way.
    pub async fn fetch_previous_page(&self, page_param: Option<P>) -> InfiniteQueryObserverResult<P, Out> {
        if page_param.is_none()
            && let Some(cached) = self.observer.query_data()
            && !cached.is_empty()
            && self.fetcher().previous_param(&cached).is_none()
        {
            trace!("no previous page");
            return self.get_current_result();
        }
        let fetch_fn = self.fetcher().fetch_fn(FetchMode::Previous(page_param));
        self.run(FetchOptions {
            cancel_refetch: false,
            direction: Some(FetchDirection::Backward),
            fetch_fn: Some(fetch_fn),
        })
        .await
    }

    /// Re-fetches every page in order, joining a running fetch.
    pub async fn refetch(&self) -> InfiniteQueryObserverResult<P, Out> {
        self.refetch_with(RefetchOptions::default()).await
    }

    /// [`InfiniteQueryObserver::refetch`] with explicit options.
    pub async fn refetch_with(&self, options: RefetchOptions) -> InfiniteQueryObserverResult<P, Out> {
        let result = self.observer.refetch_with(options).await;
        let cached = self.observer.query_data();
        decorate(&self.fetcher(), cached.as_deref(), result)
    }

    /// Re-fetches only the pages `predicate(page, index, all_pages)` selects;
    /// the others keep their place and value. A running fetch is joined
    /// instead.
    pub async fn refetch_page(
        &self,
        predicate: impl Fn(&Page, usize, &[Page]) -> bool + Send + Sync + 'static,
    ) -> InfiniteQueryObserverResult<P, Out> {
        let fetch_fn = self
            .fetcher()
            .fetch_fn(FetchMode::Refetch(Some(Arc::new(predicate))));
        self.run(FetchOptions {
            cancel_refetch: false,
            direction: None,
            fetch_fn: Some(fetch_fn),
        })
        .await
    }

    pub fn destroy(&self) {
        self.observer.destroy();
    }

    async fn run(&self, options: FetchOptions<InfiniteData<P, Page>>) -> InfiniteQueryObserverResult<P, Out> {
        match self.observer.fetch_with(options) {
            Ok(fetch) => {
                // failures are reported through the result
                let _ = fetch.await;
            }
            Err(e) => warn!(error = %e, "page fetch failed to start"),
        }
        self.observer.update_result();
        self.get_current_result()
    }
}

impl<P, Page, Out> fmt::Debug for InfiniteQueryObserver<P, Page, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserver")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}
