//! Per-aggregate revision gate.
//!
//! Events that carry an aggregate id and a revision are admitted strictly in
//! revision order. An event whose revision is ahead of the expected one is
//! parked in an [`OrderQueue`] until its predecessor commits, or until the
//! checkpoint store shows the gap has closed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use common::{Event, EventDefinition};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, oneshot};

use crate::{
    GuardConfig, GuardError, MissingEventPolicy, OrderQueue, Result, RevisionGuardStore,
    TimeoutDecision,
};

/// Diagnostic information passed to the missing-event hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEventInfo {
    pub key: String,
    pub aggregate_id: Option<String>,
    pub aggregate: Option<String>,
    pub context: Option<String>,
    /// Revision carried by the waiting event.
    pub aggregate_revision: u64,
    /// Revision the guard is waiting for.
    pub guard_revision: Option<u64>,
}

/// Called when a queued event has waited `queue_timeout_max_loops` timeouts
/// without its predecessors arriving.
pub type MissingEventHook = Arc<dyn Fn(&MissingEventInfo, &Event) + Send + Sync>;

/// Result of passing an event through the guard.
#[derive(Debug)]
pub enum GuardOutcome {
    /// The event is next in line. Dispatch it, then settle the admission.
    Admitted(Admission),
    /// The event's revision is already behind the checkpoint.
    AlreadyDenormalized,
}

#[derive(Debug)]
struct Handling {
    revision: u64,
    event_id: String,
}

enum Wake {
    Admit { prior: Option<u64> },
    Behind,
}

#[derive(Default)]
struct GuardState {
    handling: HashMap<String, Handling>,
    waiters: HashMap<(String, String), oneshot::Sender<Result<Wake>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Current,
    Behind,
    Ahead,
}

fn classify(revision: u64, expected: Option<u64>) -> Position {
    match expected {
        None => Position::Current,
        Some(e) if revision == e => Position::Current,
        Some(e) if revision < e => Position::Behind,
        Some(_) => Position::Ahead,
    }
}

/// One async lock per aggregate key. Checkpoint reads and writes for a key
/// happen under its lock; `GuardState` is only locked around map updates.
#[derive(Default)]
struct KeyLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyLock {
            locks: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

struct KeyLock<'a> {
    locks: &'a KeyLocks,
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // Only the map and this handle are left: nobody else waits on the key
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

struct Inner {
    store: Arc<dyn RevisionGuardStore>,
    definition: EventDefinition,
    config: GuardConfig,
    queue: OrderQueue<u64>,
    key_locks: KeyLocks,
    state: Mutex<GuardState>,
    on_event_missing: RwLock<Option<MissingEventHook>>,
}

/// Gates events so that, per aggregate key, revisions are handled one at a
/// time and in order.
///
/// Cloning is cheap: clones share the same in-flight state and queue.
#[derive(Clone)]
pub struct RevisionGuard {
    inner: Arc<Inner>,
}

impl RevisionGuard {
    pub fn new(
        store: Arc<dyn RevisionGuardStore>,
        definition: EventDefinition,
        config: GuardConfig,
    ) -> Self {
        let queue = OrderQueue::new(config.queue_timeout);
        Self {
            inner: Arc::new(Inner {
                store,
                definition,
                config,
                queue,
                key_locks: KeyLocks::default(),
                state: Mutex::new(GuardState::default()),
                on_event_missing: RwLock::new(None),
            }),
        }
    }

    /// Registers the hook invoked for gaps that do not close.
    pub async fn on_event_missing(&self, hook: MissingEventHook) {
        *self.inner.on_event_missing.write().await = Some(hook);
    }

    /// Returns the checkpoint store.
    pub fn store(&self) -> &Arc<dyn RevisionGuardStore> {
        &self.inner.store
    }

    /// Waits until `event` may be handled.
    ///
    /// Returns immediately when the event is next in line or already behind
    /// the checkpoint. Otherwise the event is queued and this call resolves
    /// once its predecessor has been committed.
    #[tracing::instrument(skip(self, event), fields(key))]
    pub async fn guard(&self, event: &Event) -> Result<GuardOutcome> {
        let definition = &self.inner.definition;
        let revision = definition
            .revision_of(event)
            .ok_or_else(|| GuardError::InvalidRevision("event carries no revision".to_string()))?;
        let key = definition.aggregate_key(event);
        if key.is_empty() {
            return Err(GuardError::InvalidKey);
        }
        let event_id = definition
            .id_of(event)
            .unwrap_or_else(|| revision.to_string());
        tracing::Span::current().record("key", key.as_str());

        let receiver = {
            let _key_lock = self.inner.key_locks.lock(&key).await;

            let in_flight = {
                let state = self.inner.state.lock().await;
                match state.handling.get(&key) {
                    Some(handling) if handling.event_id == event_id => {
                        return Err(GuardError::AlreadyProcessing { key, event_id });
                    }
                    Some(handling) if revision <= handling.revision => {
                        tracing::debug!(revision, "event already denormalized");
                        return Ok(GuardOutcome::AlreadyDenormalized);
                    }
                    Some(_) => true,
                    None => false,
                }
            };

            if !in_flight {
                let stored = self.inner.store.get(&key).await?;
                let expected = stored.or(self.inner.config.start_revision_number);
                match classify(revision, expected) {
                    Position::Current => {
                        self.inner.state.lock().await.handling.insert(
                            key.clone(),
                            Handling {
                                revision,
                                event_id: event_id.clone(),
                            },
                        );
                        return Ok(GuardOutcome::Admitted(Admission::new(
                            self.clone(),
                            key,
                            event_id,
                            revision,
                            stored,
                        )));
                    }
                    Position::Behind => {
                        tracing::debug!(revision, ?expected, "event already denormalized");
                        return Ok(GuardOutcome::AlreadyDenormalized);
                    }
                    Position::Ahead => {}
                }
            }

            let mut state = self.inner.state.lock().await;
            self.enqueue(&mut state, &key, &event_id, revision, event)
                .await?
        };

        match receiver.await {
            Ok(Ok(Wake::Admit { prior })) => Ok(GuardOutcome::Admitted(Admission::new(
                self.clone(),
                key,
                event_id,
                revision,
                prior,
            ))),
            Ok(Ok(Wake::Behind)) => Ok(GuardOutcome::AlreadyDenormalized),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GuardError::Released { key, event_id }),
        }
    }

    async fn enqueue(
        &self,
        state: &mut GuardState,
        key: &str,
        event_id: &str,
        revision: u64,
        event: &Event,
    ) -> Result<oneshot::Receiver<Result<Wake>>> {
        let guard = self.clone();
        let timeout_key = key.to_string();
        let timeout_id = event_id.to_string();
        let queued_event = event.clone();
        let on_timeout = move |loop_count: u32| {
            let guard = guard.clone();
            let key = timeout_key.clone();
            let event_id = timeout_id.clone();
            let event = queued_event.clone();
            async move {
                guard
                    .on_queue_timeout(&key, &event_id, revision, loop_count, &event)
                    .await
            }
        };

        self.inner
            .queue
            .push(key, event_id, revision, Some(on_timeout))
            .await?;

        let (sender, receiver) = oneshot::channel();
        state
            .waiters
            .insert((key.to_string(), event_id.to_string()), sender);

        metrics::counter!("denormalizer_events_queued_total").increment(1);
        tracing::debug!(revision, "event queued until earlier revisions are handled");
        Ok(receiver)
    }

    async fn on_queue_timeout(
        &self,
        key: &str,
        event_id: &str,
        revision: u64,
        loop_count: u32,
        event: &Event,
    ) -> TimeoutDecision {
        let _key_lock = self.inner.key_locks.lock(key).await;
        let waiter_key = (key.to_string(), event_id.to_string());
        {
            let state = self.inner.state.lock().await;
            if !state.waiters.contains_key(&waiter_key) {
                return TimeoutDecision::Stop;
            }
            if state.handling.contains_key(key) {
                // The predecessor is in flight and wakes us when it commits
                return TimeoutDecision::Rearm;
            }
        }

        let stored = match self.inner.store.get(key).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read checkpoint for queued event");
                return TimeoutDecision::Rearm;
            }
        };
        let expected = stored.or(self.inner.config.start_revision_number);

        let mut state = self.inner.state.lock().await;
        // Released by `clear` while the checkpoint was read
        if !state.waiters.contains_key(&waiter_key) {
            return TimeoutDecision::Stop;
        }

        match classify(revision, expected) {
            Position::Current => {
                self.inner.queue.remove(key, event_id).await;
                self.admit_waiter(&mut state, key, event_id, revision, stored);
                TimeoutDecision::Stop
            }
            Position::Behind => {
                self.inner.queue.remove(key, event_id).await;
                if let Some(sender) = state.waiters.remove(&waiter_key) {
                    let _ = sender.send(Ok(Wake::Behind));
                }
                TimeoutDecision::Stop
            }
            Position::Ahead => {
                if loop_count < self.inner.config.queue_timeout_max_loops {
                    return TimeoutDecision::Rearm;
                }

                let definition = &self.inner.definition;
                let info = MissingEventInfo {
                    key: key.to_string(),
                    aggregate_id: definition.aggregate_id_of(event),
                    aggregate: definition.aggregate_of(event),
                    context: definition.context_of(event),
                    aggregate_revision: revision,
                    guard_revision: expected,
                };
                tracing::warn!(
                    key,
                    revision,
                    ?expected,
                    loop_count,
                    "events missing before queued event"
                );
                metrics::counter!("denormalizer_missing_events_total").increment(1);

                let hook = self.inner.on_event_missing.read().await.clone();
                if let Some(hook) = hook {
                    hook(&info, event);
                }

                match self.inner.config.on_max_loops {
                    MissingEventPolicy::KeepWaiting => TimeoutDecision::Rearm,
                    MissingEventPolicy::GiveUp => {
                        self.inner.queue.remove(key, event_id).await;
                        if let Some(sender) = state.waiters.remove(&waiter_key) {
                            let _ = sender.send(Err(GuardError::MissingEvents {
                                key: key.to_string(),
                                expected: expected.unwrap_or_default(),
                                actual: revision,
                            }));
                        }
                        TimeoutDecision::Stop
                    }
                }
            }
        }
    }

    // Marks a queued event as in flight and hands it its admission.
    fn admit_waiter(
        &self,
        state: &mut GuardState,
        key: &str,
        event_id: &str,
        revision: u64,
        prior: Option<u64>,
    ) -> bool {
        let Some(sender) = state
            .waiters
            .remove(&(key.to_string(), event_id.to_string()))
        else {
            return false;
        };
        state.handling.insert(
            key.to_string(),
            Handling {
                revision,
                event_id: event_id.to_string(),
            },
        );
        if sender.send(Ok(Wake::Admit { prior })).is_err() {
            state.handling.remove(key);
            return false;
        }
        true
    }

    // After `key` committed `next`, admits a queued event carrying `next` and
    // settles queued events that are now behind.
    async fn wake_next(&self, state: &mut GuardState, key: &str, next: u64) {
        let mut admitted = false;
        for (event_id, revision) in self.inner.queue.get(key).await {
            if revision < next {
                self.inner.queue.remove(key, &event_id).await;
                if let Some(sender) = state.waiters.remove(&(key.to_string(), event_id)) {
                    let _ = sender.send(Ok(Wake::Behind));
                }
            } else if revision == next && !admitted {
                self.inner.queue.remove(key, &event_id).await;
                admitted = self.admit_waiter(state, key, &event_id, revision, Some(next));
            }
        }
    }

    async fn settle(&self, admission: &Admission, commit: bool) -> Result<()> {
        let _key_lock = self.inner.key_locks.lock(&admission.key).await;

        let result = if commit {
            let next = admission.revision + 1;
            self.inner
                .store
                .set(&admission.key, next, admission.prior)
                .await
        } else {
            Ok(())
        };

        let mut state = self.inner.state.lock().await;

        if state
            .handling
            .get(&admission.key)
            .is_some_and(|h| h.event_id == admission.event_id)
        {
            state.handling.remove(&admission.key);
        }

        match result {
            Ok(()) if commit => {
                self.wake_next(&mut state, &admission.key, admission.revision + 1)
                    .await;
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    key = %admission.key,
                    revision = admission.revision,
                    error = %e,
                    "failed to commit revision"
                );
                Err(e)
            }
        }
    }

    /// Returns the number of aggregates with an event in flight.
    pub async fn in_flight_count(&self) -> usize {
        self.inner.state.lock().await.handling.len()
    }

    /// Returns the number of queued events.
    pub async fn queued_count(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Forgets every in-flight revision and releases every queued event.
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        state.handling.clear();
        for ((key, event_id), sender) in state.waiters.drain() {
            let _ = sender.send(Err(GuardError::Released { key, event_id }));
        }
        self.inner.queue.clear().await;
    }
}

/// Permission to handle one event.
///
/// Call [`finish`](Self::finish) once the event has been dispatched, or
/// [`abandon`](Self::abandon) if dispatch failed. An admission dropped
/// without either is abandoned in the background.
pub struct Admission {
    guard: RevisionGuard,
    key: String,
    event_id: String,
    revision: u64,
    prior: Option<u64>,
    settled: bool,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("key", &self.key)
            .field("event_id", &self.event_id)
            .field("revision", &self.revision)
            .field("prior", &self.prior)
            .finish()
    }
}

impl Admission {
    fn new(
        guard: RevisionGuard,
        key: String,
        event_id: String,
        revision: u64,
        prior: Option<u64>,
    ) -> Self {
        Self {
            guard,
            key,
            event_id,
            revision,
            prior,
            settled: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Commits the checkpoint (`revision + 1`, optimistic against the value
    /// read at admission) and admits the next queued revision, if any.
    pub async fn finish(mut self) -> Result<()> {
        self.settled = true;
        let guard = self.guard.clone();
        guard.settle(&self, true).await
    }

    /// Releases the in-flight slot without committing. Queued successors keep
    /// waiting and are reported through the missing-event hook.
    pub async fn abandon(mut self) {
        self.settled = true;
        let guard = self.guard.clone();
        let _ = guard.settle(&self, false).await;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let released = Admission {
            guard: self.guard.clone(),
            key: std::mem::take(&mut self.key),
            event_id: std::mem::take(&mut self.event_id),
            revision: self.revision,
            prior: self.prior,
            settled: true,
        };
        handle.spawn(async move {
            let guard = released.guard.clone();
            let _ = guard.settle(&released, false).await;
        });
    }
}
