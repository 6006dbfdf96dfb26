use thiserror::Error;

/// Error type for query operations.
///
/// Errors are `Clone` because a single failure is shared by every observer
/// attached to the failing query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The fetch was aborted by cancellation or removal of its query.
    #[error("Query was cancelled")]
    Cancelled,

    /// The query key could not be serialized into a cache identity.
    #[error("Key not serializable: {0}")]
    Serialization(String),

    /// A cached query exists for the hash but stores a different data type.
    #[error("Query {query_hash} holds data of a different type")]
    TypeMismatch { query_hash: String },

    #[error("Infinite data has {pages} pages but {page_params} page params")]
    PageMismatch { pages: usize, page_params: usize },
}

impl QueryError {
    /// Creates a [`QueryError::FetchError`] from any displayable error.
    pub fn fetch(err: impl std::fmt::Display) -> Self {
        Self::FetchError(err.to_string())
    }

    /// Returns `true` if this error represents a cancelled fetch.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
