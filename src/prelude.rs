//! Prelude module for convenient imports.
//!
//! ```
//! use querykit::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The cache owner
//! - [`QueryOptions`] and [`QueryObserver`] - Observing a single query
//! - [`InfiniteQueryOptions`] and [`InfiniteQueryObserver`] - Paginated queries
//! - [`QueryKey`] and [`KeyValue`] - Building keys
//! - [`QueryError`] - The error type

pub use crate::cache::{QueryFilters, QueryTypeFilter};
pub use crate::client::QueryClient;
pub use crate::config::QueryConfig;
pub use crate::error::QueryError;
pub use crate::infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions, PageFnContext};
pub use crate::key::{KeyValue, QueryKey};
pub use crate::observer::{QueryObserver, QueryObserverResult, QueryOptions};
pub use crate::query::{QueryFnContext, QueryStatus};
pub use crate::retryer::{Retry, RetryDelay};
pub use crate::subscription::Subscription;
