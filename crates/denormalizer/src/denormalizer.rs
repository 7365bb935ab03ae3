//! The denormalizer facade: live handling, replay and host hooks.

use std::future::Future;
use std::sync::Arc;

use common::{Event, EventDefinition, NotificationDefinition, path};
use futures_core::Stream;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use revision_guard::{
    ConnectionEvent, GuardOutcome, MissingEventHook, MissingEventInfo, RevisionGuard,
    RevisionGuardStore,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::registry::RegistryInfo;
use crate::{
    BoxError, DenormalizerError, DenormalizerOptions, Dispatched, Errors, EventDispatcher,
    Registry, ReplayHandler, ReplaySession, Result, Settings,
};

/// Receives every handled event, after extension.
pub type EventHook =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;
/// Receives every notification.
pub type NotificationHook =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;
/// Extends every handled event before the matching event extender runs.
pub type EventExtension =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<Event, BoxError>> + Send + Sync>;

const AGGREGATE_DESTROYED: &str = "AggregateDestroyedError";

/// A successfully handled event: the extended event and its notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub event: Event,
    pub notifications: Vec<Value>,
}

impl Handled {
    fn unchanged(event: Event) -> Self {
        Self {
            event,
            notifications: Vec::new(),
        }
    }
}

/// Everything [`Denormalizer::dispatch`] produced, errors included.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub event: Event,
    pub notifications: Vec<Value>,
    pub errors: Errors,
}

/// A live event whose handling failed.
///
/// Carries the event as far as it got (extended, if extension ran) and the
/// notifications produced before the failure.
#[derive(Debug)]
pub struct HandleError {
    pub event: Event,
    pub notifications: Vec<Value>,
    pub errors: Errors,
}

impl HandleError {
    fn rejected(event: Event, errors: impl Into<Errors>) -> Self {
        Self {
            event,
            notifications: Vec::new(),
            errors: errors.into(),
        }
    }
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to handle event: {}", self.errors)
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.errors)
    }
}

/// Routes live events through the revision guard into the view builders and
/// drives replays.
pub struct Denormalizer {
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    store: Arc<dyn RevisionGuardStore>,
    guard: RevisionGuard,
    dispatcher: EventDispatcher,
    replay_handler: ReplayHandler,
    on_event: Option<EventHook>,
    on_notification: Option<NotificationHook>,
    on_event_missing: Option<MissingEventHook>,
    default_event_extension: Option<EventExtension>,
}

impl std::fmt::Debug for Denormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Denormalizer")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Denormalizer {
    pub fn builder<S>(registry: Registry, store: S) -> DenormalizerBuilder
    where
        S: RevisionGuardStore + 'static,
    {
        DenormalizerBuilder::new(registry, Arc::new(store))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn RevisionGuardStore> {
        &self.store
    }

    /// Connects every repository and the checkpoint store, and installs the
    /// missing-event hook.
    #[tracing::instrument(skip_all)]
    pub async fn init(&self) -> Result<()> {
        for collection in self.registry.collections() {
            collection.connect().await?;
        }
        self.store.connect().await?;
        if !self.settings.options.skip_on_event_missing {
            self.guard.on_event_missing(self.missing_event_hook()).await;
        }
        tracing::info!(
            collections = self.registry.collections().count(),
            "denormalizer initialized"
        );
        Ok(())
    }

    fn missing_event_hook(&self) -> MissingEventHook {
        match &self.on_event_missing {
            Some(hook) => Arc::clone(hook),
            None => Arc::new(|info: &MissingEventInfo, _: &Event| {
                tracing::warn!(
                    key = %info.key,
                    aggregate_revision = info.aggregate_revision,
                    guard_revision = ?info.guard_revision,
                    "events are missing"
                );
            }),
        }
    }

    fn report_missing(&self, info: &MissingEventInfo, event: &Event) {
        if self.settings.options.skip_on_event_missing {
            return;
        }
        metrics::counter!("denormalizer_missing_events_total").increment(1);
        self.missing_event_hook()(info, event);
    }

    /// Handles one live event.
    ///
    /// Events carrying an aggregate id and a revision pass the revision guard
    /// first and are dispatched in revision order. An event whose revision is
    /// already behind the checkpoint is acknowledged without dispatch. When
    /// dispatch fails the checkpoint is not moved, and the error carries the
    /// event and notifications produced so far.
    #[tracing::instrument(skip_all, fields(event_id = ?self.settings.event.id_of(&event)))]
    pub async fn handle(&self, event: Event) -> std::result::Result<Handled, HandleError> {
        metrics::counter!("denormalizer_events_handled_total").increment(1);
        let definition = &self.settings.event;

        if !event.is_object() {
            let error = DenormalizerError::InvalidEvent("event is not an object".to_string());
            return Err(HandleError::rejected(event, error));
        }
        let name = match definition.name.as_deref() {
            Some(p) if event.exists(p) => definition.name_of(&event).unwrap_or_default(),
            _ => {
                let error = DenormalizerError::InvalidEvent(format!(
                    "event has no name at '{}'",
                    definition.name.as_deref().unwrap_or_default()
                ));
                return Err(HandleError::rejected(event, error));
            }
        };

        let rejected = name == self.settings.options.command_rejected_event_name;
        if rejected && self.is_aggregate_destroyed(&event) {
            return match self.check_destroyed_aggregate(&event).await {
                Ok(()) => Ok(Handled::unchanged(event)),
                Err(e) => Err(HandleError::rejected(event, e)),
            };
        }

        if rejected || !definition.tracks_revision(&event) {
            return into_handled(self.dispatch(event).await);
        }

        let admission = match self.guard.guard(&event).await {
            Ok(GuardOutcome::Admitted(admission)) => admission,
            Ok(GuardOutcome::AlreadyDenormalized) => {
                tracing::debug!("event already denormalized");
                return Ok(Handled::unchanged(event));
            }
            Err(e) => return Err(HandleError::rejected(event, e)),
        };

        let outcome = self.dispatch(event).await;
        if !outcome.errors.is_empty() {
            admission.abandon().await;
            return into_handled(outcome);
        }
        if let Err(e) = admission.finish().await {
            return into_handled(DispatchOutcome {
                errors: e.into(),
                ..outcome
            });
        }
        into_handled(outcome)
    }

    fn is_aggregate_destroyed(&self, event: &Event) -> bool {
        let payload = self.settings.event.payload_of(event);
        path::get(&payload, "reason.name").and_then(Value::as_str) == Some(AGGREGATE_DESTROYED)
    }

    /// Compares a command rejection for a destroyed aggregate against the
    /// checkpoint store. If the domain knows revisions this side never saw,
    /// they are reported as missing.
    async fn check_destroyed_aggregate(&self, event: &Event) -> Result<()> {
        let definition = &self.settings.event;
        let payload = definition.payload_of(event);
        let aggregate_id = path::get(&payload, "reason.aggregateId")
            .filter(|v| v.is_string() || v.is_number())
            .and_then(path::scalar_to_string)
            .filter(|id| !id.is_empty());
        let aggregate_revision = path::get(&payload, "reason.aggregateRevision")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let mut info = MissingEventInfo {
            key: aggregate_id.clone().unwrap_or_default(),
            aggregate_id: aggregate_id.clone(),
            aggregate: definition.aggregate_of(event),
            context: definition.context_of(event),
            aggregate_revision,
            guard_revision: None,
        };

        let revision_known = definition
            .revision
            .as_deref()
            .is_some_and(|p| !p.is_empty() && event.exists(p));
        let Some(aggregate_id) = aggregate_id.filter(|_| revision_known) else {
            self.report_missing(&info, event);
            return Ok(());
        };

        let stored = self.store.get(&aggregate_id).await?;
        tracing::debug!(
            aggregate_id = %aggregate_id,
            stored = ?stored,
            aggregate_revision,
            "aggregate destroyed"
        );
        match stored {
            Some(next) if next > aggregate_revision + 1 => {
                tracing::debug!("checkpoint is ahead of the domain");
            }
            Some(next) if next == aggregate_revision + 1 => {}
            _ => {
                info.guard_revision = stored;
                self.report_missing(&info, event);
            }
        }
        Ok(())
    }

    /// Runs the full pipeline for one event without the revision guard:
    /// pre-event extender, view builders, event extension and publishing.
    ///
    /// A failing pre-event extender stops the pipeline. A failing event
    /// extension suppresses publishing.
    #[tracing::instrument(skip_all)]
    pub async fn dispatch(&self, event: Event) -> DispatchOutcome {
        let mut errors = Errors::new();

        let target = self.dispatcher.target_of(&event);
        let event = match self.registry.pre_event_extender(&target) {
            Some(extender) => match extender.extend(event.clone()).await {
                Ok(extended) => extended,
                Err(e) => {
                    errors.push(e);
                    return DispatchOutcome {
                        event,
                        notifications: Vec::new(),
                        errors,
                    };
                }
            },
            None => event,
        };

        let Dispatched {
            notifications,
            errors: failed,
        } = self.dispatcher.dispatch(&event).await;
        errors.extend(failed);

        let (extended, extend_errors) = self.extend_event(event).await;
        if extend_errors.is_empty() {
            errors.extend(self.publish(&extended, &notifications).await);
        } else {
            tracing::warn!(errors = %extend_errors, "event extension failed, nothing published");
            errors.extend(extend_errors);
        }

        DispatchOutcome {
            event: extended,
            notifications,
            errors,
        }
    }

    async fn extend_event(&self, event: Event) -> (Event, Errors) {
        let mut errors = Errors::new();
        let target = self.dispatcher.target_of(&event);

        let mut extended = event;
        if let Some(extension) = &self.default_event_extension {
            match extension(extended.clone()).await {
                Ok(e) => extended = e,
                Err(source) => errors.push(DenormalizerError::Hook {
                    hook: "default_event_extension",
                    source,
                }),
            }
        }

        if self.settings.options.skip_extend_event {
            return (extended, errors);
        }
        if let Some(extender) = self.registry.event_extender(&target) {
            match extender.extend(extended.clone()).await {
                Ok(e) => extended = e,
                Err(e) => errors.push(e),
            }
        }
        (extended, errors)
    }

    async fn publish(&self, event: &Event, notifications: &[Value]) -> Errors {
        let options = &self.settings.options;
        let notify = async {
            match &self.on_notification {
                Some(hook) if !options.skip_on_notification => {
                    join_all(notifications.iter().cloned().map(|n| hook(n))).await
                }
                _ => Vec::new(),
            }
        };
        let publish = async {
            match &self.on_event {
                Some(hook) if !options.skip_on_event => hook(event.clone()).await,
                _ => Ok(()),
            }
        };
        let (notified, published) = tokio::join!(notify, publish);
        metrics::counter!("denormalizer_notifications_total").increment(notifications.len() as u64);

        let mut errors = Errors::new();
        for source in notified.into_iter().filter_map(|r| r.err()) {
            errors.push(DenormalizerError::Hook {
                hook: "on_notification",
                source,
            });
        }
        if let Err(source) = published {
            errors.push(DenormalizerError::Hook {
                hook: "on_event",
                source,
            });
        }
        errors
    }

    /// Replays `events` in order.
    pub async fn replay(
        &self,
        events: impl IntoIterator<Item = Event>,
    ) -> std::result::Result<(), Errors> {
        self.replay_handler.replay(events).await
    }

    /// Opens a replay session to feed events one at a time.
    pub fn replay_streamed(&self) -> ReplaySession {
        self.replay_handler.start()
    }

    /// Replays every event of `stream`.
    pub async fn replay_stream<S>(&self, stream: S) -> std::result::Result<(), Errors>
    where
        S: Stream<Item = Event>,
    {
        self.replay_handler.replay_stream(stream).await
    }

    /// Returns the last event saved by a replay.
    pub async fn get_last_event(&self) -> Result<Option<Event>> {
        Ok(self.store.get_last_event().await?)
    }

    /// Removes every replayable view model, every checkpoint and all
    /// in-flight guard state.
    #[tracing::instrument(skip_all)]
    pub async fn clear(&self) -> Result<()> {
        self.replay_handler.clear().await?;
        self.guard.clear().await;
        Ok(())
    }

    pub fn info(&self) -> RegistryInfo {
        self.registry.info()
    }

    /// Subscribes to connection changes of the checkpoint store.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.store.subscribe()
    }
}

fn into_handled(outcome: DispatchOutcome) -> std::result::Result<Handled, HandleError> {
    let DispatchOutcome {
        event,
        notifications,
        errors,
    } = outcome;
    if !errors.is_empty() {
        return Err(HandleError {
            event,
            notifications,
            errors,
        });
    }
    Ok(Handled {
        event,
        notifications,
    })
}

/// Configures a [`Denormalizer`].
pub struct DenormalizerBuilder {
    registry: Registry,
    store: Arc<dyn RevisionGuardStore>,
    settings: Settings,
    on_event: Option<EventHook>,
    on_notification: Option<NotificationHook>,
    on_event_missing: Option<MissingEventHook>,
    default_event_extension: Option<EventExtension>,
}

impl DenormalizerBuilder {
    fn new(registry: Registry, store: Arc<dyn RevisionGuardStore>) -> Self {
        Self {
            registry,
            store,
            settings: Settings::default(),
            on_event: None,
            on_notification: None,
            on_event_missing: None,
            default_event_extension: None,
        }
    }

    pub fn options(mut self, options: DenormalizerOptions) -> Self {
        self.settings.options = options;
        self
    }

    pub fn event_definition(mut self, definition: EventDefinition) -> Self {
        self.settings.event = definition;
        self
    }

    pub fn notification_definition(mut self, definition: NotificationDefinition) -> Self {
        self.settings.notification = definition;
        self
    }

    /// Generates notification ids instead of the collections' repositories.
    pub fn id_generator<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.settings.id_generator = Some(Arc::new(f));
        self
    }

    pub fn on_event<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.on_event = Some(Arc::new(move |e| f(e).boxed()));
        self
    }

    pub fn on_notification<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.on_notification = Some(Arc::new(move |n| f(n).boxed()));
        self
    }

    /// Called with diagnostics when revisions are missing. Without it,
    /// missing revisions are only logged.
    pub fn on_event_missing<F>(mut self, f: F) -> Self
    where
        F: Fn(&MissingEventInfo, &Event) + Send + Sync + 'static,
    {
        self.on_event_missing = Some(Arc::new(f));
        self
    }

    pub fn default_event_extension<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Event, BoxError>> + Send + 'static,
    {
        self.default_event_extension = Some(Arc::new(move |e| f(e).boxed()));
        self
    }

    pub fn build(self) -> Denormalizer {
        let registry = Arc::new(self.registry);
        let settings = Arc::new(self.settings);
        let guard = RevisionGuard::new(
            Arc::clone(&self.store),
            settings.event.clone(),
            settings.options.revision_guard.clone(),
        );
        Denormalizer {
            dispatcher: EventDispatcher::new(Arc::clone(&registry), Arc::clone(&settings)),
            replay_handler: ReplayHandler::new(
                Arc::clone(&registry),
                Arc::clone(&self.store),
                Arc::clone(&settings),
            ),
            registry,
            settings,
            store: self.store,
            guard,
            on_event: self.on_event,
            on_notification: self.on_notification,
            on_event_missing: self.on_event_missing,
            default_event_extension: self.default_event_extension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Collection, DenormFn, Selector, ViewBuilder};
    use revision_guard::InMemoryRevisionStore;
    use serde_json::json;
    use view_store::InMemoryRepository;

    fn create_test_denormalizer() -> Denormalizer {
        let registry = Registry::builder()
            .collection(Collection::new("persons", InMemoryRepository::new()))
            .view_builder(
                "persons",
                ViewBuilder::new(Selector::new("personCreated"), DenormFn::Merge)
                    .with_id_path("aggregate.id"),
            )
            .build()
            .unwrap();
        Denormalizer::builder(registry, InMemoryRevisionStore::new())
            .event_definition(
                EventDefinition::new()
                    .with_aggregate_id("aggregate.id")
                    .with_revision("revision"),
            )
            .build()
    }

    #[tokio::test]
    async fn non_object_events_are_rejected() {
        let denormalizer = create_test_denormalizer();
        let errors = denormalizer
            .handle(Event::new(json!("personCreated")))
            .await
            .unwrap_err()
            .errors;
        assert!(matches!(
            errors.iter().next(),
            Some(DenormalizerError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn events_without_name_are_rejected() {
        let denormalizer = create_test_denormalizer();
        let errors = denormalizer
            .handle(Event::new(json!({"id": "e1"})))
            .await
            .unwrap_err()
            .errors;
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn events_without_revision_bypass_the_guard() {
        let denormalizer = create_test_denormalizer();
        let handled = denormalizer
            .handle(Event::new(json!({
                "id": "e1",
                "name": "personCreated",
                "aggregate": {"id": "p1"},
                "payload": {"name": "Ada"}
            })))
            .await
            .unwrap();

        assert_eq!(handled.notifications.len(), 1);
        assert_eq!(denormalizer.store().get("p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn default_extension_runs_before_publishing() {
        let registry = Registry::builder().build().unwrap();
        let denormalizer = Denormalizer::builder(registry, InMemoryRevisionStore::new())
            .default_event_extension(|event: Event| async move {
                Ok(event.with("meta.seen", json!(true)))
            })
            .build();

        let outcome = denormalizer
            .dispatch(Event::new(json!({"id": "e1", "name": "anything"})))
            .await;
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.event.get("meta.seen"), Some(&json!(true)));
    }
}
