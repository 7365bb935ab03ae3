use thiserror::Error;

/// Errors raised by the revision guard, its queue and checkpoint stores.
#[derive(Debug, Error)]
pub enum GuardError {
    /// An optimistic checkpoint write found a different stored revision.
    #[error("Concurrency conflict for {key}: expected revision {expected:?}, found {actual:?}")]
    ConcurrencyConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The same event is already queued or being handled for this aggregate.
    #[error("Event {event_id} for {key} is already being processed")]
    AlreadyProcessing { key: String, event_id: String },

    /// A queued event was given up on because earlier revisions never arrived.
    #[error("Missing events for {key}: expected revision {expected}, got {actual}")]
    MissingEvents {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// A queued event was released before it could be admitted.
    #[error("Queued event {event_id} for {key} was released")]
    Released { key: String, event_id: String },

    /// The aggregate key is empty.
    #[error("Invalid aggregate key")]
    InvalidKey,

    /// The revision is missing or not a positive integer.
    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    /// The checkpoint backend failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl GuardError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Result type for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
