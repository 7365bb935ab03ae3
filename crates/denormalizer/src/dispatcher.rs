//! Fans one event out to every view builder it reaches.

use std::sync::Arc;

use common::Event;
use futures_util::future::join_all;
use serde_json::Value;

use crate::registry::BoundViewBuilder;
use crate::selector::Target;
use crate::{Errors, Registry, Settings};

/// What dispatching one event produced. Errors from individual view builders
/// do not stop the others.
#[derive(Debug, Default)]
pub struct Dispatched {
    pub notifications: Vec<Value>,
    pub errors: Errors,
}

impl Dispatched {
    fn collect(&mut self, result: crate::Result<Vec<Value>>) {
        match result {
            Ok(notifications) => self.notifications.extend(notifications),
            Err(e) => self.errors.push(e),
        }
    }
}

/// Routes events to view builders through the registry.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
    settings: Arc<Settings>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<Registry>, settings: Arc<Settings>) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn target_of(&self, event: &Event) -> Target {
        Target::of(&self.settings.event, event)
    }

    /// Runs every matching view builder. When any of them has a priority
    /// they run one after another in priority order, otherwise concurrently.
    #[tracing::instrument(skip_all, fields(event = %self.target_of(event).name))]
    pub async fn dispatch(&self, event: &Event) -> Dispatched {
        let target = self.target_of(event);
        let builders = self.registry.view_builders(&target);
        let mut dispatched = Dispatched::default();

        if builders.is_empty() {
            tracing::debug!("no view builder matches");
            return dispatched;
        }

        if builders.iter().any(|b| b.priority().is_some()) {
            tracing::debug!(count = builders.len(), "dispatching in priority order");
            for builder in &builders {
                dispatched.collect(builder.denormalize(event, &self.settings).await);
            }
        } else {
            tracing::debug!(count = builders.len(), "dispatching concurrently");
            let results = join_all(
                builders
                    .iter()
                    .map(|b: &BoundViewBuilder| b.denormalize(event, &self.settings)),
            )
            .await;
            for result in results {
                dispatched.collect(result);
            }
        }

        if !dispatched.errors.is_empty() {
            tracing::warn!(errors = %dispatched.errors, "view builders failed");
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Collection, DenormFn, Selector, ViewBuilder};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use view_store::InMemoryRepository;

    fn create_test_event() -> Event {
        Event::new(json!({
            "id": "evt-1",
            "name": "personCreated",
            "aggregate": {"id": "p1"},
            "payload": {"name": "Ada"}
        }))
    }

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        delay: Duration,
    ) -> DenormFn {
        let log = Arc::clone(log);
        DenormFn::apply_async(move |_, vm, _| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push(label);
                vm.set("by", json!(label));
                Ok(())
            })
        })
    }

    fn dispatcher(builders: Vec<ViewBuilder>) -> EventDispatcher {
        let mut registry = Registry::builder().collection(Collection::new(
            "persons",
            InMemoryRepository::new(),
        ));
        for builder in builders {
            registry = registry.view_builder("persons", builder);
        }
        EventDispatcher::new(
            Arc::new(registry.build().unwrap()),
            Arc::new(Settings::default()),
        )
    }

    #[tokio::test]
    async fn prioritized_builders_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(vec![
            ViewBuilder::new(
                Selector::new("personCreated"),
                recording(&log, "second", Duration::ZERO),
            )
            .with_priority(2),
            ViewBuilder::new(
                Selector::new("personCreated"),
                recording(&log, "first", Duration::from_millis(20)),
            )
            .with_priority(1),
        ]);

        let dispatched = dispatcher.dispatch(&create_test_event()).await;

        assert!(dispatched.errors.is_empty());
        assert_eq!(dispatched.notifications.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn unprioritized_builders_all_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(vec![
            ViewBuilder::new(
                Selector::new("personCreated"),
                recording(&log, "slow", Duration::from_millis(20)),
            ),
            ViewBuilder::new(
                Selector::new("personCreated"),
                recording(&log, "fast", Duration::ZERO),
            ),
        ]);

        let dispatched = dispatcher.dispatch(&create_test_event()).await;

        assert_eq!(dispatched.notifications.len(), 2);
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn failures_are_collected_without_stopping_others() {
        let dispatcher = dispatcher(vec![
            ViewBuilder::new(
                Selector::new("personCreated"),
                DenormFn::apply(|_, _, _| Err("broken".into())),
            ),
            ViewBuilder::new(Selector::new("personCreated"), DenormFn::Merge),
        ]);

        let dispatched = dispatcher.dispatch(&create_test_event()).await;

        assert_eq!(dispatched.errors.len(), 1);
        assert_eq!(dispatched.notifications.len(), 1);
    }

    #[tokio::test]
    async fn unmatched_events_produce_nothing() {
        let dispatcher = dispatcher(vec![ViewBuilder::new(
            Selector::new("personDeleted"),
            DenormFn::Delete,
        )]);

        let dispatched = dispatcher.dispatch(&create_test_event()).await;
        assert!(dispatched.notifications.is_empty());
        assert!(dispatched.errors.is_empty());
    }
}
