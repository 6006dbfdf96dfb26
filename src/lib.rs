//! # Querykit - asynchronous query cache for tokio
//!
//! Querykit caches the results of asynchronous fetches under structured keys
//! and keeps every interested consumer up to date. It is modelled on the query
//! core of TanStack Query: a cache of per-key state machines, a retrying fetch
//! executor, observers that derive a view of one query, and an infinite
//! pagination extension.
//!
//! ## Architecture
//!
//! 1. **Keys**: structured values hashed into a stable cache identity
//! 2. **Cache**: maps key hashes to queries and collects unused ones
//! 3. **Query**: one key's status, data, error and fetch metadata
//! 4. **Retryer**: runs a fetch with retries, backoff and cancellation
//! 5. **Observer**: one consumer's view of a query, with subscriptions
//! 6. **Client**: owns a cache and its defaults; runs bulk operations
//!
//! ## Core Components
//!
//! - [`QueryClient`](client::QueryClient): Cache owner and imperative API
//! - [`QueryObserver`](observer::QueryObserver): Subscribes to one query
//! - [`InfiniteQueryObserver`](infinite::InfiniteQueryObserver): Paginated queries
//! - [`QueryKey`](key::QueryKey): Hashed query identity
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use querykit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueryError> {
//!     let client = QueryClient::new();
//!
//!     let key = QueryKey::new(vec!["todos".into(), KeyValue::object([("page", 1.into())])])?;
//!     let options = QueryOptions::new(key, |ctx: QueryFnContext| {
//!         async move {
//!             // fetch from somewhere; `ctx.signal` is cancelled on abort
//!             let _ = ctx.query_key;
//!             Ok::<_, QueryError>(vec!["write docs".to_string()])
//!         }
//!         .boxed()
//!     });
//!
//!     let observer = QueryObserver::new(&client, options)?;
//!     let _subscription = observer.subscribe(|result| {
//!         if let Some(todos) = &result.data {
//!             println!("{} todos", todos.len());
//!         }
//!     });
//!
//!     let result = observer.refetch().await;
//!     assert!(result.is_success());
//!     Ok(())
//! }
//! ```
//!
//! The library emits [`tracing`] events and never installs a subscriber.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod infinite;
pub mod key;
pub mod observer;
pub mod prelude;
pub mod query;
pub mod retryer;
pub mod subscription;

pub use cache::{CacheEvent, QueryCache, QueryFilters, QueryTypeFilter};
pub use client::QueryClient;
pub use config::{QueryConfig, QueryOverrides};
pub use error::QueryError;
pub use infinite::{
    InfiniteData, InfiniteQueryObserver, InfiniteQueryObserverResult, InfiniteQueryOptions,
    PageFnContext,
};
pub use key::{KeyValue, QueryKey};
pub use observer::{QueryObserver, QueryObserverResult, QueryOptions, RefetchOptions};
pub use query::{QueryFnContext, QueryState, QueryStatus};
pub use retryer::{Retry, RetryDelay};
pub use subscription::Subscription;
