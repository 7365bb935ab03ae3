//! Denormalizer error types.

use std::fmt;

use revision_guard::GuardError;
use thiserror::Error;
use view_store::RepositoryError;

/// Error type returned by user-supplied projection and hook functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while denormalizing events.
#[derive(Debug, Error)]
pub enum DenormalizerError {
    /// The registry or options are inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The event is not a JSON object or lacks its name.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A view-model repository call failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The revision guard or its checkpoint store failed.
    #[error("Revision guard error: {0}")]
    Guard(#[from] GuardError),

    /// A view builder's user function failed.
    #[error("View builder '{view_builder}' failed: {source}")]
    Projection {
        view_builder: String,
        source: BoxError,
    },

    /// An event extender's user function failed.
    #[error("Event extender '{extender}' failed: {source}")]
    Extender { extender: String, source: BoxError },

    /// A host hook failed.
    #[error("{hook} hook failed: {source}")]
    Hook { hook: &'static str, source: BoxError },

    /// Buffered replay state was flushed outside replay mode.
    #[error("Collection '{0}' is not replaying")]
    NotReplaying(String),

    /// The replay worker task stopped before draining its queue.
    #[error("Replay worker stopped unexpectedly")]
    ReplayWorker,
}

impl DenormalizerError {
    /// Returns true for optimistic-concurrency conflicts reported by a
    /// view-model repository.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_concurrency_conflict())
    }
}

/// Result type for denormalizer operations.
pub type Result<T> = std::result::Result<T, DenormalizerError>;

/// Every error collected while handling one event or one replay run.
#[derive(Debug, Default)]
pub struct Errors(Vec<DenormalizerError>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: DenormalizerError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DenormalizerError> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<DenormalizerError> {
        self.0
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> std::result::Result<(), Errors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.0.len())?;
        for (i, error) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

impl From<DenormalizerError> for Errors {
    fn from(error: DenormalizerError) -> Self {
        Self(vec![error])
    }
}

impl From<GuardError> for Errors {
    fn from(error: GuardError) -> Self {
        Self(vec![error.into()])
    }
}

impl Extend<DenormalizerError> for Errors {
    fn extend<I: IntoIterator<Item = DenormalizerError>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Errors {
    type Item = DenormalizerError;
    type IntoIter = std::vec::IntoIter<DenormalizerError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_is_detected_through_repository_errors() {
        let conflict = DenormalizerError::from(RepositoryError::ConcurrencyConflict {
            id: "vm-1".to_string(),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_concurrency_conflict());
        assert!(!DenormalizerError::ReplayWorker.is_concurrency_conflict());
    }

    #[test]
    fn errors_display_lists_every_error() {
        let mut errors = Errors::new();
        errors.push(DenormalizerError::Config("no collections".to_string()));
        errors.push(DenormalizerError::ReplayWorker);

        let text = errors.to_string();
        assert!(text.starts_with("2 error(s): Configuration error: no collections"));
        assert!(text.ends_with("; Replay worker stopped unexpectedly"));
    }

    #[test]
    fn empty_errors_are_ok() {
        assert!(Errors::new().into_result().is_ok());
        assert!(Errors::from(DenormalizerError::ReplayWorker).into_result().is_err());
    }
}
