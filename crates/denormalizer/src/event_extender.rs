//! Event extenders rewrite events around dispatch.
//!
//! A pre-event extender runs before view builders see an event; an event
//! extender runs afterwards and shapes the event published to the host. Both
//! are [`EventExtender`]s, registered in different slots of the registry.

use std::future::Future;
use std::sync::Arc;

use common::{Event, path};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use view_store::ViewModel;

use crate::{BoxError, Collection, DenormalizerError, Result, Selector};

type Extended = BoxFuture<'static, std::result::Result<Event, BoxError>>;

/// The extension logic and what it is handed.
#[derive(Clone)]
pub enum ExtendFn {
    /// Receives the whole event.
    Event(Arc<dyn Fn(Event) -> Extended + Send + Sync>),
    /// Receives the payload and the view model whose id the event carries.
    ViewModel(Arc<dyn Fn(Value, ViewModel) -> Extended + Send + Sync>),
    /// Receives the payload and the owning collection.
    Collection(Arc<dyn Fn(Value, Arc<Collection>) -> Extended + Send + Sync>),
}

/// Rewrites the events its [`Selector`] matches.
pub struct EventExtender {
    selector: Selector,
    extend: ExtendFn,
    id_path: Option<String>,
    payload: Option<String>,
    id_getter: Option<Arc<dyn Fn(&Event) -> std::result::Result<String, BoxError> + Send + Sync>>,
}

impl std::fmt::Debug for EventExtender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventExtender")
            .field("selector", &self.selector)
            .field("id_path", &self.id_path)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

impl EventExtender {
    fn with_fn(selector: Selector, extend: ExtendFn) -> Self {
        Self {
            selector,
            extend,
            id_path: None,
            payload: None,
            id_getter: None,
        }
    }

    pub fn new<F, Fut>(selector: Selector, f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Event, BoxError>> + Send + 'static,
    {
        Self::with_fn(selector, ExtendFn::Event(Arc::new(move |e| f(e).boxed())))
    }

    /// Synchronous variant of [`new`](Self::new).
    pub fn from_fn<F>(selector: Selector, f: F) -> Self
    where
        F: Fn(Event) -> std::result::Result<Event, BoxError> + Send + Sync + 'static,
    {
        Self::with_fn(
            selector,
            ExtendFn::Event(Arc::new(move |e| std::future::ready(f(e)).boxed())),
        )
    }

    /// Extends using the view model whose id is found at the id path, or
    /// computed by [`use_as_id`](Self::use_as_id). Only valid inside a
    /// collection.
    pub fn with_view_model<F, Fut>(selector: Selector, f: F) -> Self
    where
        F: Fn(Value, ViewModel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Event, BoxError>> + Send + 'static,
    {
        Self::with_fn(
            selector,
            ExtendFn::ViewModel(Arc::new(move |payload, vm| f(payload, vm).boxed())),
        )
    }

    /// Extends using the owning collection. Only valid inside a collection.
    pub fn with_collection<F, Fut>(selector: Selector, f: F) -> Self
    where
        F: Fn(Value, Arc<Collection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Event, BoxError>> + Send + 'static,
    {
        Self::with_fn(
            selector,
            ExtendFn::Collection(Arc::new(move |payload, c| f(payload, c).boxed())),
        )
    }

    pub fn with_id_path(mut self, path: impl Into<String>) -> Self {
        self.id_path = Some(path.into());
        self
    }

    /// Event path of the payload handed to view-model and collection
    /// extenders. Unset or empty hands over the whole event.
    pub fn with_payload(mut self, path: impl Into<String>) -> Self {
        self.payload = Some(path.into());
        self
    }

    pub fn use_as_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> std::result::Result<String, BoxError> + Send + Sync + 'static,
    {
        self.id_getter = Some(Arc::new(f));
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Returns true if this extender can only run inside a collection.
    pub fn needs_collection(&self) -> bool {
        !matches!(self.extend, ExtendFn::Event(_))
    }

    fn failed(&self, source: BoxError) -> DenormalizerError {
        DenormalizerError::Extender {
            extender: self.selector.label().to_string(),
            source,
        }
    }

    fn payload_of(&self, event: &Event) -> Value {
        match self.payload.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => event.get(p).cloned().unwrap_or(Value::Null),
            None => event.as_value().clone(),
        }
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

    /// Returns the extended event.
    #[tracing::instrument(skip_all, fields(extender = %self.selector.label()))]
    pub async fn extend(
        &self,
        collection: Option<&Arc<Collection>>,
        event: Event,
    ) -> Result<Event> {
        match (&self.extend, collection) {
            (ExtendFn::Event(f), _) => f(event).await.map_err(|e| self.failed(e)),
            (ExtendFn::ViewModel(f), Some(collection)) => {
                let id = self.extract_id(collection, &event).await?;
                let vm = collection.load_view_model(&id).await?;
                f(self.payload_of(&event), vm)
                    .await
                    .map_err(|e| self.failed(e))
            }
            (ExtendFn::Collection(f), Some(collection)) => {
                f(self.payload_of(&event), Arc::clone(collection))
                    .await
                    .map_err(|e| self.failed(e))
            }
            (_, None) => Err(DenormalizerError::Config(format!(
                "event extender '{}' needs a collection",
                self.selector.label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use view_store::{InMemoryRepository, ViewModelRepository};

    fn create_test_event() -> Event {
        Event::new(json!({
            "id": "evt-1",
            "name": "orderPlaced",
            "aggregate": {"id": "o1"},
            "payload": {"customerId": "c1"}
        }))
    }

    #[tokio::test]
    async fn event_extender_rewrites_event() {
        let extender = EventExtender::from_fn(Selector::new("orderPlaced"), |event| {
            Ok(event.with("meta.extended", json!(true)))
        });

        let extended = extender.extend(None, create_test_event()).await.unwrap();
        assert_eq!(extended.get("meta.extended"), Some(&json!(true)));
        assert!(!extender.needs_collection());
    }

    #[tokio::test]
    async fn view_model_extender_loads_by_id_path() {
        let repo = InMemoryRepository::new();
        let mut customer = ViewModel::new("c1");
        customer.set("name", json!("Ada"));
        repo.commit(customer).await.unwrap();
        let collection = Arc::new(Collection::new("customers", repo));

        let extender = EventExtender::with_view_model(
            Selector::new("orderPlaced"),
            |event: Value, vm: ViewModel| async move {
                let name = vm.get("name").unwrap_or(Value::Null);
                Ok(Event::new(event).with("payload.customerName", name))
            },
        )
        .with_id_path("payload.customerId");

        let extended = extender
            .extend(Some(&collection), create_test_event())
            .await
            .unwrap();
        assert_eq!(extended.get("payload.customerName"), Some(&json!("Ada")));
        assert!(extender.needs_collection());
    }

    #[tokio::test]
    async fn collection_extender_without_collection_is_rejected() {
        let extender = EventExtender::with_collection(
            Selector::new("orderPlaced"),
            |payload: Value, _collection: Arc<Collection>| async move { Ok(Event::new(payload)) },
        );

        let result = extender.extend(None, create_test_event()).await;
        assert!(matches!(result, Err(DenormalizerError::Config(_))));
    }

    #[tokio::test]
    async fn extender_errors_are_wrapped() {
        let extender = EventExtender::from_fn(Selector::generic(), |_| Err("offline".into()));

        let result = extender.extend(None, create_test_event()).await;
        assert!(matches!(
            result,
            Err(DenormalizerError::Extender { ref extender, .. }) if extender == "*"
        ));
    }
}
