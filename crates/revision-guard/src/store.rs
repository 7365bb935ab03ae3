use async_trait::async_trait;
use common::Event;
use tokio::sync::broadcast;

use crate::Result;

/// Connection state changes published by a checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Core trait for revision checkpoint stores.
///
/// A store keeps, per aggregate key, the next revision expected for that
/// aggregate, plus a single "last event" checkpoint used to resume replays.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RevisionGuardStore: Send + Sync {
    /// Opens the backend connection and publishes [`ConnectionEvent::Connected`].
    async fn connect(&self) -> Result<()>;

    /// Closes the backend connection and publishes [`ConnectionEvent::Disconnected`].
    async fn disconnect(&self) -> Result<()>;

    /// Returns the next expected revision for `key`, if one is stored.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Stores `revision` for `key`.
    ///
    /// Optimistic: fails with
    /// [`GuardError::ConcurrencyConflict`](crate::GuardError::ConcurrencyConflict)
    /// if a value is stored and it differs from `old_revision`.
    async fn set(&self, key: &str, revision: u64, old_revision: Option<u64>) -> Result<()>;

    /// Saves the last event seen, for resumable replay.
    async fn save_last_event(&self, event: &Event) -> Result<()>;

    /// Returns the last saved event.
    async fn get_last_event(&self) -> Result<Option<Event>>;

    /// Removes every checkpoint and the last event.
    async fn clear(&self) -> Result<()>;

    /// Subscribes to connection state changes.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}
