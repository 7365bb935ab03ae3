//! Replay of historical events.
//!
//! A [`ReplaySession`] accepts events one by one. Each event becomes one or
//! more tasks that a single worker drains strictly in feed order, with every
//! touched collection buffering its writes. Finishing the session flushes the
//! buffers, moves the revision checkpoints past the replayed revisions and
//! saves the last event fed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use common::Event;
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::future::join_all;
use revision_guard::RevisionGuardStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::BoundViewBuilder;
use crate::selector::Target;
use crate::{Collection, DenormalizerError, Errors, Registry, Result, Settings};

/// Starts replay sessions and resets replayable state.
#[derive(Clone)]
pub struct ReplayHandler {
    registry: Arc<Registry>,
    store: Arc<dyn RevisionGuardStore>,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for ReplayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayHandler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ReplayHandler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RevisionGuardStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Opens a session. Must be called within a tokio runtime.
    pub fn start(&self) -> ReplaySession {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(
            receiver,
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
        ));
        ReplaySession {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            sender,
            worker,
            seen: HashSet::new(),
            revisions: HashMap::new(),
            touched: Vec::new(),
            last_event: None,
            fed: 0,
            started: Instant::now(),
        }
    }

    /// Replays `events` in order and finishes the session.
    pub async fn replay(
        &self,
        events: impl IntoIterator<Item = Event>,
    ) -> std::result::Result<(), Errors> {
        let mut session = self.start();
        for event in events {
            session.replay(event);
        }
        session.done().await
    }

    /// Replays every event of `stream` and finishes the session.
    pub async fn replay_stream<S>(&self, stream: S) -> std::result::Result<(), Errors>
    where
        S: Stream<Item = Event>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut session = self.start();
        while let Some(event) = stream.next().await {
            session.replay(event);
        }
        session.done().await
    }

    /// Removes every view model of the replayable collections and every
    /// revision checkpoint.
    pub async fn clear(&self) -> Result<()> {
        for collection in self.registry.collections().filter(|c| !c.is_no_replay()) {
            collection.clear().await?;
        }
        self.store.clear().await?;
        Ok(())
    }
}

struct Task {
    event: Event,
    builders: Vec<BoundViewBuilder>,
}

/// One replay run. Feed events with [`replay`](Self::replay), then call
/// [`done`](Self::done).
pub struct ReplaySession {
    registry: Arc<Registry>,
    store: Arc<dyn RevisionGuardStore>,
    settings: Arc<Settings>,
    sender: mpsc::UnboundedSender<Task>,
    worker: JoinHandle<Errors>,
    seen: HashSet<String>,
    revisions: HashMap<String, u64>,
    touched: Vec<Arc<Collection>>,
    last_event: Option<Event>,
    fed: u64,
    started: Instant,
}

impl std::fmt::Debug for ReplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySession")
            .field("fed", &self.fed)
            .field("aggregates", &self.revisions.len())
            .field("collections", &self.touched.len())
            .finish_non_exhaustive()
    }
}

impl ReplaySession {
    /// Queues one event. Events already fed in this session, identified by
    /// aggregate key and event id, are dropped.
    pub fn replay(&mut self, event: Event) {
        metrics::counter!("denormalizer_replay_events_total").increment(1);
        self.fed += 1;
        self.last_event = Some(event.clone());

        let definition = &self.settings.event;
        let key = definition
            .tracks_revision(&event)
            .then(|| definition.aggregate_key(&event));

        if let Some(id) = definition.id_of(&event) {
            let dedup = match &key {
                Some(key) => format!("{key}:{id}"),
                None => id,
            };
            if !self.seen.insert(dedup) {
                tracing::debug!(event_id = ?definition.id_of(&event), "duplicate event dropped");
                return;
            }
        }

        if let Some(key) = &key
            && let Some(revision) = definition.revision_of(&event)
        {
            let highest = self.revisions.entry(key.clone()).or_insert(revision);
            *highest = (*highest).max(revision);
        }

        let target = Target::of(definition, &event);
        let builders: Vec<BoundViewBuilder> = self
            .registry
            .view_builders(&target)
            .into_iter()
            .filter(|b| !b.collection.is_no_replay())
            .collect();
        if builders.is_empty() {
            return;
        }

        for builder in &builders {
            if !self
                .touched
                .iter()
                .any(|c| Arc::ptr_eq(c, &builder.collection))
            {
                builder.collection.start_replay();
                self.touched.push(Arc::clone(&builder.collection));
            }
        }

        let tasks: Vec<Task> = if builders.iter().any(|b| b.priority().is_some()) {
            builders
                .into_iter()
                .map(|b| Task {
                    event: event.clone(),
                    builders: vec![b],
                })
                .collect()
        } else {
            vec![Task { event, builders }]
        };
        for task in tasks {
            if self.sender.send(task).is_err() {
                tracing::warn!("replay worker is gone, event not queued");
            }
        }
    }

    /// Waits for every queued task, then flushes the touched collections,
    /// commits the revision checkpoints and saves the last event.
    ///
    /// Errors from individual events do not stop the run; all of them are
    /// returned together.
    #[tracing::instrument(skip_all, fields(events = self.fed))]
    pub async fn done(self) -> std::result::Result<(), Errors> {
        let Self {
            store,
            sender,
            worker,
            revisions,
            touched,
            last_event,
            started,
            ..
        } = self;
        drop(sender);

        let mut errors = match worker.await {
            Ok(errors) => errors,
            Err(e) => {
                tracing::warn!(error = %e, "replay worker failed");
                Errors::from(DenormalizerError::ReplayWorker)
            }
        };

        let flushes = join_all(touched.iter().map(|c| c.save_replaying_vms()));
        let checkpoints = join_all(
            revisions
                .iter()
                .map(|(key, revision)| commit_checkpoint(store.as_ref(), key, *revision)),
        );
        let last = async {
            match &last_event {
                Some(event) => store
                    .save_last_event(event)
                    .await
                    .map_err(DenormalizerError::from),
                None => Ok(()),
            }
        };
        let (flushes, checkpoints, last) = tokio::join!(flushes, checkpoints, last);
        for result in flushes.into_iter().chain(checkpoints).chain([last]) {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        metrics::histogram!("denormalizer_replay_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if errors.is_empty() {
            tracing::info!(aggregates = revisions.len(), "replay finished");
        } else {
            tracing::warn!(errors = %errors, "replay finished with errors");
        }
        errors.into_result()
    }
}

/// Moves the checkpoint of `key` to `revision + 1`. A checkpoint that is
/// already there or beyond is left alone.
async fn commit_checkpoint(
    store: &dyn RevisionGuardStore,
    key: &str,
    revision: u64,
) -> Result<()> {
    let next = revision + 1;
    let current = store.get(key).await?;
    if current.is_some_and(|c| c >= next) {
        tracing::debug!(key, current = ?current, next, "checkpoint already ahead");
        return Ok(());
    }
    store.set(key, next, current).await?;
    Ok(())
}

async fn drain(
    mut receiver: mpsc::UnboundedReceiver<Task>,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Errors {
    let mut errors = Errors::new();
    while let Some(task) = receiver.recv().await {
        errors.extend(run_task(&registry, &settings, task).await);
    }
    errors
}

/// Runs one task: pre-extends the event, then denormalizes it. Builders of
/// the same collection run in sequence, different collections concurrently.
async fn run_task(registry: &Registry, settings: &Settings, task: Task) -> Vec<DenormalizerError> {
    let Task { mut event, builders } = task;

    if let Some(extender) = registry.pre_event_extender(&Target::of(&settings.event, &event)) {
        match extender.extend(event).await {
            Ok(extended) => event = extended,
            Err(e) => return vec![e],
        }
    }

    let mut groups: Vec<Vec<&BoundViewBuilder>> = Vec::new();
    for builder in &builders {
        match groups
            .iter_mut()
            .find(|g| Arc::ptr_eq(&g[0].collection, &builder.collection))
        {
            Some(group) => group.push(builder),
            None => groups.push(vec![builder]),
        }
    }

    let event = &event;
    let results = join_all(groups.into_iter().map(|group| async move {
        let mut failed = Vec::new();
        for builder in group {
            if let Err(e) = builder.denormalize(event, settings).await {
                failed.push(e);
            }
        }
        failed
    }))
    .await;
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DenormFn, Selector, ViewBuilder};
    use revision_guard::InMemoryRevisionStore;
    use serde_json::json;
    use view_store::{InMemoryRepository, ViewModelRepositoryExt};

    fn settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.event = settings
            .event
            .with_aggregate_id("aggregate.id")
            .with_revision("revision");
        Arc::new(settings)
    }

    fn create_test_event(id: &str, aggregate_id: &str, revision: u64) -> Event {
        Event::new(json!({
            "id": id,
            "name": "counted",
            "aggregate": {"id": aggregate_id},
            "revision": revision,
            "payload": {}
        }))
    }

    fn counting_handler(repo: &InMemoryRepository) -> ReplayHandler {
        let registry = Registry::builder()
            .collection(Collection::new("counters", repo.clone()))
            .view_builder(
                "counters",
                ViewBuilder::new(
                    Selector::new("counted"),
                    DenormFn::apply(|_, vm, _| {
                        let count = vm.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                        vm.set("count", json!(count + 1));
                        Ok(())
                    }),
                )
                .with_id_path("aggregate.id"),
            )
            .build()
            .unwrap();
        ReplayHandler::new(
            Arc::new(registry),
            Arc::new(InMemoryRevisionStore::new()),
            settings(),
        )
    }

    #[tokio::test]
    async fn duplicates_are_denormalized_once() {
        let repo = InMemoryRepository::new();
        let handler = counting_handler(&repo);

        handler
            .replay(vec![
                create_test_event("e1", "a1", 1),
                create_test_event("e1", "a1", 1),
                create_test_event("e2", "a1", 2),
            ])
            .await
            .unwrap();

        let counter = repo.get_if_exists("a1").await.unwrap().unwrap();
        assert_eq!(counter.get("count"), Some(json!(2)));
    }

    #[tokio::test]
    async fn checkpoints_move_past_highest_revision() {
        let repo = InMemoryRepository::new();
        let handler = counting_handler(&repo);

        handler
            .replay(vec![
                create_test_event("e1", "a1", 1),
                create_test_event("e3", "a1", 3),
                create_test_event("e2", "a1", 2),
            ])
            .await
            .unwrap();

        assert_eq!(handler.store.get("a1").await.unwrap(), Some(4));
        let last = handler.store.get_last_event().await.unwrap().unwrap();
        assert_eq!(last.get("id"), Some(&json!("e2")));
    }

    #[tokio::test]
    async fn duplicates_do_not_count_towards_checkpoints() {
        let repo = InMemoryRepository::new();
        let handler = counting_handler(&repo);
        let mut session = handler.start();

        session.replay(create_test_event("e1", "a1", 1));
        session.replay(create_test_event("e2", "a1", 2));
        session.replay(create_test_event("e2", "a1", 2));
        assert_eq!(session.revisions.get("a1"), Some(&2));
        assert_eq!(session.seen.len(), 2);
        session.done().await.unwrap();

        assert_eq!(handler.store.get("a1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn checkpoints_never_move_backwards() {
        let repo = InMemoryRepository::new();
        let handler = counting_handler(&repo);
        handler.store.set("a1", 10, None).await.unwrap();

        handler
            .replay(vec![create_test_event("e1", "a1", 1)])
            .await
            .unwrap();

        assert_eq!(handler.store.get("a1").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn clear_resets_view_models_and_checkpoints() {
        let repo = InMemoryRepository::new();
        let handler = counting_handler(&repo);
        handler
            .replay(vec![create_test_event("e1", "a1", 1)])
            .await
            .unwrap();

        handler.clear().await.unwrap();

        assert!(repo.is_empty().await);
        assert_eq!(handler.store.get("a1").await.unwrap(), None);
    }
}
