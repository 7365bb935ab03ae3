//! View builders: the per-event denormalization logic of a collection.
//!
//! A view builder resolves which view models an event touches, runs its
//! [`DenormFn`] against each of them and persists the result through its
//! collection. A commit rejected with a concurrency conflict is retried
//! after a random wait, reloading the view model first.

use std::sync::Arc;
use std::time::Duration;

use common::{Event, NotificationDefinition, path};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::{Map, Value};
use view_store::{Action, Query, QueryOptions, ViewModel};

use crate::{BoxError, Collection, DenormalizerError, Result, Selector, Settings};

/// Synchronous denormalization logic.
pub type SyncDenorm = Arc<
    dyn Fn(Value, &mut ViewModel, &mut DenormContext) -> std::result::Result<(), BoxError>
        + Send
        + Sync,
>;

/// Asynchronous denormalization logic.
pub type AsyncDenorm = Arc<
    dyn for<'a> Fn(
            Value,
            &'a mut ViewModel,
            &'a mut DenormContext,
        ) -> BoxFuture<'a, std::result::Result<(), BoxError>>
        + Send
        + Sync,
>;

pub type EventPredicate = Arc<dyn Fn(&Event) -> std::result::Result<bool, BoxError> + Send + Sync>;
pub type ViewModelPredicate =
    Arc<dyn Fn(&Event, &ViewModel) -> std::result::Result<bool, BoxError> + Send + Sync>;
pub type AfterCommit = Arc<
    dyn Fn(&Event, &ViewModel, &DenormContext) -> std::result::Result<(), BoxError> + Send + Sync,
>;
pub type IdGetter = Arc<dyn Fn(&Event) -> std::result::Result<String, BoxError> + Send + Sync>;
pub type QueryFn = Arc<dyn Fn(&Event) -> std::result::Result<Query, BoxError> + Send + Sync>;
pub type ForEachFn = Arc<dyn Fn(&Event) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync>;

/// What a view builder does to each view model it targets.
#[derive(Clone)]
pub enum DenormFn {
    /// Merges the payload's top-level fields into the view model.
    Merge,
    /// Marks the view model for deletion.
    Delete,
    Apply(SyncDenorm),
    ApplyAsync(AsyncDenorm),
}

impl DenormFn {
    pub fn apply<F>(f: F) -> Self
    where
        F: Fn(Value, &mut ViewModel, &mut DenormContext) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self::Apply(Arc::new(f))
    }

    pub fn apply_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(
                Value,
                &'a mut ViewModel,
                &'a mut DenormContext,
            ) -> BoxFuture<'a, std::result::Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::ApplyAsync(Arc::new(f))
    }

    async fn run(
        &self,
        payload: Value,
        vm: &mut ViewModel,
        ctx: &mut DenormContext,
    ) -> std::result::Result<(), BoxError> {
        match self {
            Self::Merge => {
                vm.merge(&payload);
                Ok(())
            }
            Self::Delete => {
                vm.destroy();
                Ok(())
            }
            Self::Apply(f) => f(payload, vm, ctx),
            Self::ApplyAsync(f) => f(payload, vm, ctx).await,
        }
    }
}

/// How long to wait before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Random wait up to the configured concurrency retry timeout.
    Default,
    /// Random wait up to the given bound.
    Within(Duration),
    /// Random wait within the given range.
    Between(Duration, Duration),
}

impl RetryDelay {
    /// Picks the concrete wait. `default_max` bounds [`RetryDelay::Default`]
    /// and zero-length [`RetryDelay::Within`] delays.
    pub fn pick(&self, default_max: Duration) -> Duration {
        match *self {
            Self::Default => random_between(Duration::ZERO, default_max),
            Self::Within(max) if max.is_zero() => random_between(Duration::ZERO, default_max),
            Self::Within(max) => random_between(Duration::ZERO, max),
            Self::Between(from, to) => random_between(from, to),
        }
    }
}

fn random_between(from: Duration, to: Duration) -> Duration {
    let (from, to) = (from.as_millis() as u64, to.as_millis() as u64);
    if to <= from {
        return Duration::from_millis(from);
    }
    Duration::from_millis(rand::thread_rng().gen_range(from..=to))
}

/// Handed to a [`DenormFn`] for one attempt.
///
/// Requesting a retry abandons the attempt: nothing is saved, the view model
/// is reloaded after the wait and the function runs again. The reminder set
/// with [`remind_me`](Self::remind_me) is carried into the next attempt.
#[derive(Debug, Default)]
pub struct DenormContext {
    retry: Option<RetryDelay>,
    reminder: Option<Value>,
}

impl DenormContext {
    fn with_reminder(reminder: Option<Value>) -> Self {
        Self {
            retry: None,
            reminder,
        }
    }

    pub fn retry(&mut self) {
        self.retry = Some(RetryDelay::Default);
    }

    pub fn retry_within(&mut self, max: Duration) {
        self.retry = Some(RetryDelay::Within(max));
    }

    pub fn retry_between(&mut self, from: Duration, to: Duration) {
        self.retry = Some(RetryDelay::Between(from, to));
    }

    pub fn retry_requested(&self) -> bool {
        self.retry.is_some()
    }

    pub fn remind_me(&mut self, memo: Value) {
        self.reminder = Some(memo);
    }

    pub fn reminder(&self) -> Option<&Value> {
        self.reminder.as_ref()
    }
}

/// Denormalization logic bound to the events its [`Selector`] matches.
pub struct ViewBuilder {
    selector: Selector,
    denorm_fn: DenormFn,
    id_path: Option<String>,
    payload: Option<String>,
    priority: Option<u32>,
    auto_create: bool,
    id_getter: Option<IdGetter>,
    query: Option<Query>,
    query_fn: Option<QueryFn>,
    for_each: Option<ForEachFn>,
    should_handle_event: Option<EventPredicate>,
    should_handle: Option<ViewModelPredicate>,
    after_commit: Option<AfterCommit>,
}

impl std::fmt::Debug for ViewBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewBuilder")
            .field("selector", &self.selector)
            .field("id_path", &self.id_path)
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("auto_create", &self.auto_create)
            .finish_non_exhaustive()
    }
}

impl ViewBuilder {
    /// Creates a view builder. Without an id path, id getter, query or
    /// for-each function, every event targets a view model under a new id.
    pub fn new(selector: Selector, denorm_fn: DenormFn) -> Self {
        Self {
            selector,
            denorm_fn,
            id_path: None,
            payload: None,
            priority: None,
            auto_create: true,
            id_getter: None,
            query: None,
            query_fn: None,
            for_each: None,
            should_handle_event: None,
            should_handle: None,
            after_commit: None,
        }
    }

    /// Event path holding the target view model's id.
    pub fn with_id_path(mut self, path: impl Into<String>) -> Self {
        self.id_path = Some(path.into());
        self
    }

    /// Event path of the payload handed to the denormalization function.
    /// An empty path hands over the whole event.
    pub fn with_payload(mut self, path: impl Into<String>) -> Self {
        self.payload = Some(path.into());
        self
    }

    /// Builders with a priority run one after another, lowest first.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// With `false`, events for view models that do not exist yet are
    /// ignored.
    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    /// Computes the target id when the id path is absent from the event.
    pub fn use_as_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<String, BoxError> + Send + Sync + 'static,
    {
        self.id_getter = Some(Arc::new(f));
        self
    }

    /// Targets every view model matching a fixed query.
    pub fn use_as_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Targets every view model matching a query computed from the event.
    pub fn use_as_query_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<Query, BoxError> + Send + Sync + 'static,
    {
        self.query_fn = Some(Arc::new(f));
        self
    }

    /// Targets one view model per returned item. Each item is merged into
    /// its view model before denormalization; its `"id"` field selects the
    /// view model, and items without one get a new id.
    pub fn execute_for_each<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        self.for_each = Some(Arc::new(f));
        self
    }

    pub fn should_handle_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.should_handle_event = Some(Arc::new(f));
        self
    }

    pub fn should_handle<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, &ViewModel) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.should_handle = Some(Arc::new(f));
        self
    }

    pub fn on_after_commit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, &ViewModel, &DenormContext) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.after_commit = Some(Arc::new(f));
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn is_auto_create(&self) -> bool {
        self.auto_create
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let strategies = [
            self.query.is_some(),
            self.query_fn.is_some(),
            self.for_each.is_some(),
        ];
        if strategies.into_iter().filter(|s| *s).count() > 1 {
            return Err(DenormalizerError::Config(format!(
                "view builder '{}' combines more than one of query, query function and for-each",
                self.selector.label()
            )));
        }
        Ok(())
    }

    fn failed(&self, source: BoxError) -> DenormalizerError {
        DenormalizerError::Projection {
            view_builder: self.selector.label().to_string(),
            source,
        }
    }

    fn payload_of(&self, collection: &Collection, event: &Event) -> Value {
        let path = self
            .payload
            .as_deref()
            .unwrap_or_else(|| collection.default_payload());
        if path.is_empty() {
            return event.as_value().clone();
        }
        event.get(path).cloned().unwrap_or(Value::Null)
    }

    /// Applies `event` to every view model it targets and returns one
    /// notification per committed view model.
    #[tracing::instrument(
        skip_all,
        fields(view_builder = %self.selector.label(), collection = %collection.name())
    )]
    pub async fn denormalize(
        &self,
        collection: &Collection,
        event: &Event,
        settings: &Settings,
    ) -> Result<Vec<Value>> {
        if let Some(predicate) = &self.should_handle_event
            && !predicate(event).map_err(|e| self.failed(e))?
        {
            tracing::debug!("event declined");
            return Ok(Vec::new());
        }

        let mut notifications = Vec::new();

        if let Some(for_each) = &self.for_each {
            let items = for_each(event).map_err(|e| self.failed(e))?;
            for item in items {
                let id = match item.get("id").and_then(path::scalar_to_string) {
                    Some(id) => id,
                    None => collection.get_new_id().await?,
                };
                let vm = collection.load_view_model(&id).await?;
                notifications.extend(
                    self.handle_one(collection, event, settings, vm, Some(&item))
                        .await?,
                );
            }
            return Ok(notifications);
        }

        let query = match (&self.query, &self.query_fn) {
            (Some(query), _) => Some(query.clone()),
            (None, Some(query_fn)) => Some(query_fn(event).map_err(|e| self.failed(e))?),
            (None, None) => None,
        };
        if let Some(query) = query {
            let vms = collection
                .find_view_models(&query, &QueryOptions::new())
                .await?;
            tracing::debug!(matched = vms.len(), "query resolved");
            for vm in vms {
                notifications.extend(self.handle_one(collection, event, settings, vm, None).await?);
            }
            return Ok(notifications);
        }

        let id = self.extract_id(collection, event).await?;
        let vm = collection.load_view_model(&id).await?;
        if vm.action_on_commit() == Action::Create && !self.auto_create {
            tracing::debug!(id = %id, "view model does not exist and auto-create is off");
            return Ok(notifications);
        }
        notifications.extend(self.handle_one(collection, event, settings, vm, None).await?);
        Ok(notifications)
    }

    async fn extract_id(&self, collection: &Collection, event: &Event) -> Result<String> {
        if let Some(id) = self
            .id_path
            .as_deref()
            .and_then(|p| event.get(p))
            .and_then(path::scalar_to_string)
        {
            return Ok(id);
        }
        if let Some(getter) = &self.id_getter {
            return getter(event).map_err(|e| self.failed(e));
        }
        collection.get_new_id().await
    }

    /// Runs the denormalization function against one view model and commits
    /// it, retrying on concurrency conflicts and on request.
    async fn handle_one(
        &self,
        collection: &Collection,
        event: &Event,
        settings: &Settings,
        mut vm: ViewModel,
        init_values: Option<&Value>,
    ) -> Result<Option<Value>> {
        let payload = self.payload_of(collection, event);
        let mut reminder = None;

        loop {
            if let Some(init_values) = init_values {
                vm.merge(init_values);
            }
            if let Some(predicate) = &self.should_handle
                && !predicate(event, &vm).map_err(|e| self.failed(e))?
            {
                tracing::debug!(id = vm.id(), "view model declined");
                return Ok(None);
            }

            let mut ctx = DenormContext::with_reminder(reminder.take());
            self.denorm_fn
                .run(payload.clone(), &mut vm, &mut ctx)
                .await
                .map_err(|e| self.failed(e))?;

            let delay = match ctx.retry.take() {
                Some(delay) => delay,
                None => {
                    let notification = self
                        .generate_notification(collection, event, settings, &vm)
                        .await?;
                    match collection.save_view_model(vm.clone()).await {
                        Ok(()) => {
                            self.run_after_commit(collection, event, settings, &vm, &ctx)?;
                            return Ok(Some(notification));
                        }
                        Err(e) if e.is_concurrency_conflict() => {
                            tracing::warn!(id = vm.id(), "concurrency conflict, retrying");
                            RetryDelay::Default
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            reminder = ctx.reminder;

            if collection.is_replaying() {
                tracing::debug!(id = vm.id(), "collection is replaying, dropping retry");
                return Ok(None);
            }
            metrics::counter!("denormalizer_concurrency_retries_total").increment(1);
            tokio::time::sleep(delay.pick(settings.options.retry_on_concurrency_timeout)).await;
            if collection.is_replaying() {
                tracing::debug!(id = vm.id(), "collection started replaying, dropping retry");
                return Ok(None);
            }

            let id = vm.id().to_string();
            vm = collection.load_view_model(&id).await?;
        }
    }

    fn run_after_commit(
        &self,
        collection: &Collection,
        event: &Event,
        settings: &Settings,
        vm: &ViewModel,
        ctx: &DenormContext,
    ) -> Result<()> {
        let options = &settings.options;
        if options.skip_after_commit
            || (collection.is_replaying() && !options.call_on_after_commit_during_replay)
        {
            return Ok(());
        }
        match &self.after_commit {
            Some(after_commit) => after_commit(event, vm, ctx).map_err(|e| self.failed(e)),
            None => Ok(()),
        }
    }

    async fn generate_notification(
        &self,
        collection: &Collection,
        event: &Event,
        settings: &Settings,
        vm: &ViewModel,
    ) -> Result<Value> {
        let (evt, noti) = (&settings.event, &settings.notification);
        let mut notification = Value::Object(Map::new());

        NotificationDefinition::copy_from_event(&mut notification, &noti.meta, event, &evt.meta);
        NotificationDefinition::copy_from_event(&mut notification, &noti.event_id, event, &evt.id);
        NotificationDefinition::copy_from_event(&mut notification, &noti.event, event, &evt.name);
        NotificationDefinition::copy_from_event(
            &mut notification,
            &noti.aggregate_id,
            event,
            &evt.aggregate_id,
        );
        NotificationDefinition::copy_from_event(
            &mut notification,
            &noti.aggregate,
            event,
            &evt.aggregate,
        );
        NotificationDefinition::copy_from_event(
            &mut notification,
            &noti.context,
            event,
            &evt.context,
        );
        NotificationDefinition::copy_from_event(
            &mut notification,
            &noti.revision,
            event,
            &evt.revision,
        );
        NotificationDefinition::copy_from_event(
            &mut notification,
            &noti.correlation_id,
            event,
            &evt.correlation_id,
        );

        NotificationDefinition::write(&mut notification, &noti.payload, vm.to_json());
        NotificationDefinition::write(
            &mut notification,
            &noti.collection,
            Value::String(collection.name().to_string()),
        );
        NotificationDefinition::write(
            &mut notification,
            &noti.action,
            Value::String(vm.action_on_commit().to_string()),
        );

        let id = match &settings.id_generator {
            Some(generate) => generate(),
            None => collection.get_new_id().await?,
        };
        NotificationDefinition::write(&mut notification, &noti.id, Value::String(id));

        Ok(notification)
    }
}
