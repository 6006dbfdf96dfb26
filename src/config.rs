use std::time::Duration;

use crate::retryer::{Retry, RetryDelay, RetryPolicy};

/// Default configuration for queries created through a client.
///
/// This controls how queries cache data, when they consider it stale, and how
/// failed fetches are retried. Individual queries override fields through
/// [`QueryOverrides`].
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, queries will refetch in the background while still showing cached data.
    pub stale_time: Duration,

    /// How long an unused query is retained before being garbage collected.
    ///
    /// The timer starts when the last observer detaches.
    pub cache_time: Duration,

    /// Whether failed fetches are retried.
    pub retry: Retry,

    /// Delay between retries.
    pub retry_delay: RetryDelay,

    /// Refetch stale data when the first observer subscribes.
    pub refetch_on_mount: bool,

    /// Refetch stale data of active queries when focus is regained.
    pub refetch_on_window_focus: bool,

    /// Refetch stale data of active queries when connectivity returns.
    pub refetch_on_reconnect: bool,

    /// Refetch active queries periodically.
    pub refetch_interval: Option<Duration>,

    /// Keep exposing the previous key's data while a new key loads.
    pub keep_previous_data: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),      // immediately stale
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
            retry: Retry::default(),
            retry_delay: RetryDelay::default(),
            refetch_on_mount: true,
            refetch_on_window_focus: true,
            refetch_on_reconnect: true,
            refetch_interval: None,
            keep_previous_data: false,
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and cache times.
    #[must_use]
    pub fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = retry.into();
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub const fn with_refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.refetch_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    /// The retry settings as a policy for the retryer.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
        }
    }

    /// Merges per-query overrides over these defaults.
    #[must_use]
    pub fn merge(&self, overrides: &QueryOverrides) -> Self {
        Self {
            stale_time: overrides.stale_time.unwrap_or(self.stale_time),
            cache_time: overrides.cache_time.unwrap_or(self.cache_time),
            retry: overrides.retry.clone().unwrap_or_else(|| self.retry.clone()),
            retry_delay: overrides
                .retry_delay
                .clone()
                .unwrap_or_else(|| self.retry_delay.clone()),
            refetch_on_mount: overrides.refetch_on_mount.unwrap_or(self.refetch_on_mount),
            refetch_on_window_focus: overrides
                .refetch_on_window_focus
                .unwrap_or(self.refetch_on_window_focus),
            refetch_on_reconnect: overrides
                .refetch_on_reconnect
                .unwrap_or(self.refetch_on_reconnect),
            refetch_interval: overrides.refetch_interval.unwrap_or(self.refetch_interval),
            keep_previous_data: overrides
                .keep_previous_data
                .unwrap_or(self.keep_previous_data),
        }
    }
}

/// Per-query settings. `None` falls back to the client's [`QueryConfig`].
#[derive(Debug, Clone, Default)]
pub struct QueryOverrides {
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub refetch_on_mount: Option<bool>,
    pub refetch_on_window_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
    pub refetch_interval: Option<Option<Duration>>,
    pub keep_previous_data: Option<bool>,
}
