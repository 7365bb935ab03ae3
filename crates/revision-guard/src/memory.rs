use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Event;
use tokio::sync::{RwLock, broadcast};

use crate::{
    GuardError, Result,
    store::{ConnectionEvent, RevisionGuardStore},
};

/// In-memory checkpoint store.
#[derive(Clone)]
pub struct InMemoryRevisionStore {
    revisions: Arc<RwLock<HashMap<String, u64>>>,
    last_event: Arc<RwLock<Option<Event>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemoryRevisionStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            revisions: Arc::new(RwLock::new(HashMap::new())),
            last_event: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Returns the number of stored checkpoints.
    pub async fn checkpoint_count(&self) -> usize {
        self.revisions.read().await.len()
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryRevisionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevisionGuardStore for InMemoryRevisionStore {
    async fn connect(&self) -> Result<()> {
        self.publish(ConnectionEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.publish(ConnectionEvent::Disconnected);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        if key.is_empty() {
            return Err(GuardError::InvalidKey);
        }
        Ok(self.revisions.read().await.get(key).copied())
    }

    async fn set(&self, key: &str, revision: u64, old_revision: Option<u64>) -> Result<()> {
        if key.is_empty() {
            return Err(GuardError::InvalidKey);
        }
        if revision == 0 {
            return Err(GuardError::InvalidRevision(revision.to_string()));
        }

        let mut revisions = self.revisions.write().await;
        if let Some(&stored) = revisions.get(key)
            && Some(stored) != old_revision
        {
            return Err(GuardError::ConcurrencyConflict {
                key: key.to_string(),
                expected: old_revision,
                actual: Some(stored),
            });
        }
        revisions.insert(key.to_string(), revision);
        Ok(())
    }

    async fn save_last_event(&self, event: &Event) -> Result<()> {
        *self.last_event.write().await = Some(event.clone());
        Ok(())
    }

    async fn get_last_event(&self) -> Result<Option<Event>> {
        Ok(self.last_event.read().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        self.revisions.write().await.clear();
        *self.last_event.write().await = None;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
