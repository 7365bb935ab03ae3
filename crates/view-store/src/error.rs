use thiserror::Error;

/// Errors that can occur when interacting with a view-model repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stored view model changed since it was loaded.
    #[error("Concurrency conflict for view model {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// The view model cannot be persisted as given.
    #[error("Invalid view model: {0}")]
    InvalidViewModel(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    /// Returns true for optimistic-concurrency mismatches, which callers
    /// recover from by reloading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
