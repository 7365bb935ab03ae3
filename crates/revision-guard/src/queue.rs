//! Per-key delayed-retry queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{GuardError, Result};

/// Returned by a timeout callback to decide whether to keep waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Wait another interval and call back again if the item is still queued.
    Rearm,
    /// Stop the timer for this item.
    Stop,
}

#[derive(Debug, Clone)]
struct QueuedItem<T> {
    id: String,
    payload: T,
}

#[derive(Debug)]
struct QueueState<T> {
    items: HashMap<String, Vec<QueuedItem<T>>>,
    retries: HashMap<String, HashMap<String, u32>>,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            retries: HashMap::new(),
        }
    }
}

impl<T> QueueState<T> {
    fn contains(&self, key: &str, item_id: &str) -> bool {
        self.items
            .get(key)
            .is_some_and(|items| items.iter().any(|i| i.id == item_id))
    }
}

/// Items queued per key, each with an optional repeating timeout.
///
/// Cloning is cheap: clones share the same queue.
pub struct OrderQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
    timeout: Duration,
}

impl<T> Clone for OrderQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            timeout: self.timeout,
        }
    }
}

impl<T: Clone + Send + 'static> OrderQueue<T> {
    /// Creates an empty queue whose timeouts fire every `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            timeout,
        }
    }

    /// Queues `payload` under `key`.
    ///
    /// Fails with [`GuardError::AlreadyProcessing`] if `item_id` is already
    /// queued under `key`. If `on_timeout` is given it is called once per
    /// timeout interval with the number of previous timeouts, for as long as
    /// the item stays queued and the callback returns
    /// [`TimeoutDecision::Rearm`].
    pub async fn push<F, Fut>(
        &self,
        key: &str,
        item_id: &str,
        payload: T,
        on_timeout: Option<F>,
    ) -> Result<()>
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = TimeoutDecision> + Send + 'static,
    {
        {
            let mut state = self.state.lock().await;
            if state.contains(key, item_id) {
                tracing::debug!(key, item_id, "item already queued");
                return Err(GuardError::AlreadyProcessing {
                    key: key.to_string(),
                    event_id: item_id.to_string(),
                });
            }
            state
                .items
                .entry(key.to_string())
                .or_default()
                .push(QueuedItem {
                    id: item_id.to_string(),
                    payload,
                });
            state
                .retries
                .entry(key.to_string())
                .or_default()
                .entry(item_id.to_string())
                .or_insert(0);
        }

        if let Some(on_timeout) = on_timeout {
            self.spawn_timer(key.to_string(), item_id.to_string(), on_timeout);
        }
        Ok(())
    }

    fn spawn_timer<F, Fut>(&self, key: String, item_id: String, mut on_timeout: F)
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = TimeoutDecision> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let loop_count = {
                    let mut state = state.lock().await;
                    if !state.contains(&key, &item_id) {
                        return;
                    }
                    let counter = state
                        .retries
                        .entry(key.clone())
                        .or_default()
                        .entry(item_id.clone())
                        .or_insert(0);
                    let current = *counter;
                    *counter += 1;
                    current
                };
                tracing::trace!(key = %key, item_id = %item_id, loop_count, "queue timeout");
                if on_timeout(loop_count).await == TimeoutDecision::Stop {
                    return;
                }
            }
        });
    }

    /// Returns the queued items for `key` as `(item_id, payload)` pairs, in
    /// queue order.
    pub async fn get(&self, key: &str) -> Vec<(String, T)> {
        let state = self.state.lock().await;
        state
            .items
            .get(key)
            .map(|items| {
                items
                    .iter()
                    .map(|i| (i.id.clone(), i.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if `item_id` is queued under `key`.
    pub async fn contains(&self, key: &str, item_id: &str) -> bool {
        self.state.lock().await.contains(key, item_id)
    }

    /// Dequeues an item and resets its retry counter. Returns the payload if
    /// the item was queued.
    pub async fn remove(&self, key: &str, item_id: &str) -> Option<T> {
        let mut state = self.state.lock().await;
        let removed = state.items.get_mut(key).and_then(|items| {
            let pos = items.iter().position(|i| i.id == item_id)?;
            Some(items.remove(pos).payload)
        });
        if state.items.get(key).is_some_and(Vec::is_empty) {
            state.items.remove(key);
        }
        if let Some(retries) = state.retries.get_mut(key) {
            retries.remove(item_id);
            if retries.is_empty() {
                state.retries.remove(key);
            }
        }
        removed
    }

    /// Returns the total number of queued items.
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every queued item. Running timers stop at their next tick.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.items.clear();
        state.retries.clear();
    }
}
