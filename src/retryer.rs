//! Retrying fetch execution with backoff and cancellation.
//!
//! A [`Retryer`] runs one logical fetch. Failed attempts are retried according
//! to a [`RetryPolicy`]; cancelling the retryer's token aborts the running
//! attempt or the pending backoff delay and yields [`QueryError::Cancelled`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueryError;

/// Predicate deciding whether to retry after `failure_count` failures.
pub type RetryFn = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;

/// Maps a zero-based retry index to the delay before that retry.
pub type RetryDelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// Whether a failed fetch is attempted again.
#[derive(Clone)]
pub enum Retry {
    /// Surface the first failure.
    Never,
    /// Retry until success or cancellation.
    Always,
    /// Retry up to this many times after the first failure.
    Count(u32),
    /// Retry while the predicate returns `true`. Receives the number of
    /// failures before the current one.
    Predicate(RetryFn),
}

impl Retry {
    /// Retries while `f(failure_count, error)` returns `true`.
    pub fn when(f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Count(max) => failure_count < *max,
            Self::Predicate(f) => f(failure_count, error),
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl From<bool> for Retry {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Always } else { Self::Never }
    }
}

impl From<u32> for Retry {
    fn from(count: u32) -> Self {
        Self::Count(count)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Backoff between retries.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `base * 2^index`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    Custom(RetryDelayFn),
}

impl RetryDelay {
    pub fn custom(f: impl Fn(u32, &QueryError) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// The delay before retry number `index` (zero-based).
    pub fn delay(&self, index: u32, error: &QueryError) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Exponential { base, max } => {
                let factor = 2u32.checked_pow(index).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*max).min(*max)
            }
            Self::Custom(f) => f(index, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry settings for a single fetch.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub retry: Retry,
    pub retry_delay: RetryDelay,
}

/// Executes a fetch with retries until it succeeds, exhausts its policy, or is
/// cancelled.
#[derive(Debug)]
pub struct Retryer {
    policy: RetryPolicy,
    token: CancellationToken,
    failure_count: AtomicU32,
}

impl Retryer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_token(policy, CancellationToken::new())
    }

    /// Creates a retryer that aborts when `token` is cancelled.
    pub fn with_token(policy: RetryPolicy, token: CancellationToken) -> Self {
        Self {
            policy,
            token,
            failure_count: AtomicU32::new(0),
        }
    }

    /// The cancellation token observed by this retryer.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Aborts the running attempt or pending delay.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of failed attempts so far.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Runs `attempt` until it succeeds or the policy gives up.
    ///
    /// `on_fail` is called after every failure that will be retried, with the
    /// updated failure count.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or
    /// [`QueryError::Cancelled`] if the retryer was cancelled. A cancelled
    /// retryer never resolves successfully.
    pub async fn execute<T, F, C>(&self, mut attempt: F, mut on_fail: C) -> Result<T, QueryError>
    where
        F: FnMut() -> BoxFuture<'static, Result<T, QueryError>>,
        C: FnMut(u32, &QueryError),
    {
        loop {
            if self.token.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(QueryError::Cancelled),
                result = attempt() => result,
            };

            let error = match result {
                Ok(value) if !self.token.is_cancelled() => return Ok(value),
                Ok(_) => return Err(QueryError::Cancelled),
                Err(e) => e,
            };

            if error.is_cancelled() || self.token.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let failures = self.failure_count();
            if matches!(error, QueryError::Serialization(_))
                || !self.policy.retry.should_retry(failures, &error)
            {
                return Err(error);
            }

            self.failure_count.store(failures + 1, Ordering::Release);
            on_fail(failures + 1, &error);

            let delay = self.policy.retry_delay.delay(failures, &error);
            debug!(attempt = failures + 1, ?delay, %error, "retrying fetch");

            tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(QueryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
