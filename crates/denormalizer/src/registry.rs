//! The projection registry: collections and what is bound to them.
//!
//! Built once with [`RegistryBuilder`] and read-only afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use common::Event;
use serde::Serialize;
use serde_json::Value;

use crate::selector::{self, Target};
use crate::{Collection, DenormalizerError, EventExtender, Result, Selector, Settings, ViewBuilder};

/// A view builder together with the collection it writes to.
#[derive(Debug, Clone)]
pub struct BoundViewBuilder {
    pub collection: Arc<Collection>,
    pub view_builder: Arc<ViewBuilder>,
}

impl BoundViewBuilder {
    pub fn priority(&self) -> Option<u32> {
        self.view_builder.priority()
    }

    pub fn selector(&self) -> &Selector {
        self.view_builder.selector()
    }

    pub async fn denormalize(&self, event: &Event, settings: &Settings) -> Result<Vec<Value>> {
        self.view_builder
            .denormalize(&self.collection, event, settings)
            .await
    }
}

/// An event extender and, unless it is general, its collection.
#[derive(Debug, Clone)]
pub struct BoundEventExtender {
    pub collection: Option<Arc<Collection>>,
    pub extender: Arc<EventExtender>,
}

impl BoundEventExtender {
    pub fn selector(&self) -> &Selector {
        self.extender.selector()
    }

    pub async fn extend(&self, event: Event) -> Result<Event> {
        self.extender.extend(self.collection.as_ref(), event).await
    }
}

#[derive(Debug)]
struct Entry {
    collection: Arc<Collection>,
    view_builders: Vec<Arc<ViewBuilder>>,
    event_extenders: Vec<Arc<EventExtender>>,
    pre_event_extenders: Vec<Arc<EventExtender>>,
}

/// Every collection with its view builders and extenders, plus the general
/// extenders that belong to no collection.
#[derive(Debug)]
pub struct Registry {
    entries: Vec<Entry>,
    event_extenders: Vec<Arc<EventExtender>>,
    pre_event_extenders: Vec<Arc<EventExtender>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Collections in registration order.
    pub fn collections(&self) -> impl Iterator<Item = &Arc<Collection>> {
        self.entries.iter().map(|e| &e.collection)
    }

    pub fn collection(&self, name: &str) -> Option<&Arc<Collection>> {
        self.collections().find(|c| c.name() == name)
    }

    /// Every view builder matching `target`, across all collections, sorted
    /// by ascending priority. Builders without a priority come last, in
    /// registration order.
    pub fn view_builders(&self, target: &Target) -> Vec<BoundViewBuilder> {
        let mut found: Vec<BoundViewBuilder> = self
            .entries
            .iter()
            .flat_map(|entry| {
                selector::select_all(&entry.view_builders, target, |vb| vb.selector())
                    .into_iter()
                    .map(|vb| BoundViewBuilder {
                        collection: Arc::clone(&entry.collection),
                        view_builder: Arc::clone(vb),
                    })
            })
            .collect();
        found.sort_by_key(|b| b.priority().map_or((1, 0), |p| (0, p)));
        found
    }

    pub fn event_extender(&self, target: &Target) -> Option<BoundEventExtender> {
        self.find_extender(target, |e| &e.event_extenders, &self.event_extenders)
    }

    pub fn pre_event_extender(&self, target: &Target) -> Option<BoundEventExtender> {
        self.find_extender(target, |e| &e.pre_event_extenders, &self.pre_event_extenders)
    }

    fn find_extender(
        &self,
        target: &Target,
        slot: impl Fn(&Entry) -> &Vec<Arc<EventExtender>>,
        general: &[Arc<EventExtender>],
    ) -> Option<BoundEventExtender> {
        self.entries
            .iter()
            .find_map(|entry| {
                selector::select_first(slot(entry), target, |e| e.selector()).map(|extender| {
                    BoundEventExtender {
                        collection: Some(Arc::clone(&entry.collection)),
                        extender: Arc::clone(extender),
                    }
                })
            })
            .or_else(|| {
                selector::select_first(general, target, |e| e.selector()).map(|extender| {
                    BoundEventExtender {
                        collection: None,
                        extender: Arc::clone(extender),
                    }
                })
            })
    }

    /// Serializable summary of everything registered.
    pub fn info(&self) -> RegistryInfo {
        RegistryInfo {
            collections: self
                .entries
                .iter()
                .map(|entry| CollectionInfo {
                    name: entry.collection.name().to_string(),
                    no_replay: entry.collection.is_no_replay(),
                    view_builders: entry
                        .view_builders
                        .iter()
                        .map(|vb| ViewBuilderInfo {
                            selector: vb.selector().clone(),
                            priority: vb.priority(),
                            auto_create: vb.is_auto_create(),
                        })
                        .collect(),
                    event_extenders: selectors_of(&entry.event_extenders),
                    pre_event_extenders: selectors_of(&entry.pre_event_extenders),
                })
                .collect(),
            general_event_extenders: selectors_of(&self.event_extenders),
            general_pre_event_extenders: selectors_of(&self.pre_event_extenders),
        }
    }
}

fn selectors_of(extenders: &[Arc<EventExtender>]) -> Vec<Selector> {
    extenders.iter().map(|e| e.selector().clone()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryInfo {
    pub collections: Vec<CollectionInfo>,
    pub general_event_extenders: Vec<Selector>,
    pub general_pre_event_extenders: Vec<Selector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    pub name: String,
    pub no_replay: bool,
    pub view_builders: Vec<ViewBuilderInfo>,
    pub event_extenders: Vec<Selector>,
    pub pre_event_extenders: Vec<Selector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewBuilderInfo {
    pub selector: Selector,
    pub priority: Option<u32>,
    pub auto_create: bool,
}

enum Slot {
    ViewBuilder(ViewBuilder),
    EventExtender(EventExtender),
    PreEventExtender(EventExtender),
}

/// Collects registrations; [`build`](Self::build) validates them.
#[derive(Default)]
pub struct RegistryBuilder {
    collections: Vec<Collection>,
    bindings: Vec<(String, Slot)>,
    event_extenders: Vec<EventExtender>,
    pre_event_extenders: Vec<EventExtender>,
}

impl RegistryBuilder {
    pub fn collection(mut self, collection: Collection) -> Self {
        self.collections.push(collection);
        self
    }

    /// Binds a view builder to the collection named `collection`.
    pub fn view_builder(mut self, collection: impl Into<String>, vb: ViewBuilder) -> Self {
        self.bindings.push((collection.into(), Slot::ViewBuilder(vb)));
        self
    }

    pub fn event_extender(mut self, collection: impl Into<String>, ext: EventExtender) -> Self {
        self.bindings
            .push((collection.into(), Slot::EventExtender(ext)));
        self
    }

    pub fn pre_event_extender(mut self, collection: impl Into<String>, ext: EventExtender) -> Self {
        self.bindings
            .push((collection.into(), Slot::PreEventExtender(ext)));
        self
    }

    /// Registers an extender that belongs to no collection.
    pub fn general_event_extender(mut self, ext: EventExtender) -> Self {
        self.event_extenders.push(ext);
        self
    }

    pub fn general_pre_event_extender(mut self, ext: EventExtender) -> Self {
        self.pre_event_extenders.push(ext);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut names = HashSet::new();
        let mut entries = Vec::with_capacity(self.collections.len());
        for collection in self.collections {
            if collection.name().is_empty() {
                return Err(DenormalizerError::Config(
                    "collection name must not be empty".to_string(),
                ));
            }
            if !names.insert(collection.name().to_string()) {
                return Err(DenormalizerError::Config(format!(
                    "collection '{}' is registered twice",
                    collection.name()
                )));
            }
            entries.push(Entry {
                collection: Arc::new(collection),
                view_builders: Vec::new(),
                event_extenders: Vec::new(),
                pre_event_extenders: Vec::new(),
            });
        }

        for (name, slot) in self.bindings {
            let entry = entries
                .iter_mut()
                .find(|e| e.collection.name() == name)
                .ok_or_else(|| DenormalizerError::Config(format!("unknown collection '{name}'")))?;
            match slot {
                Slot::ViewBuilder(vb) => {
                    vb.validate()?;
                    entry.view_builders.push(Arc::new(vb));
                }
                Slot::EventExtender(ext) => entry.event_extenders.push(Arc::new(ext)),
                Slot::PreEventExtender(ext) => entry.pre_event_extenders.push(Arc::new(ext)),
            }
        }

        for ext in self.event_extenders.iter().chain(&self.pre_event_extenders) {
            if ext.needs_collection() {
                return Err(DenormalizerError::Config(format!(
                    "general event extender '{}' needs a collection",
                    ext.selector().label()
                )));
            }
        }

        Ok(Registry {
            entries,
            event_extenders: self.event_extenders.into_iter().map(Arc::new).collect(),
            pre_event_extenders: self
                .pre_event_extenders
                .into_iter()
                .map(Arc::new)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DenormFn;
    use view_store::InMemoryRepository;

    fn target(name: &str, aggregate: Option<&str>) -> Target {
        Target {
            name: name.to_string(),
            version: 0,
            aggregate: aggregate.map(str::to_string),
            context: None,
        }
    }

    fn create_test_registry() -> Registry {
        Registry::builder()
            .collection(Collection::new("persons", InMemoryRepository::new()))
            .collection(Collection::new("audit", InMemoryRepository::new()).no_replay())
            .view_builder(
                "persons",
                ViewBuilder::new(Selector::new("created"), DenormFn::Merge),
            )
            .view_builder(
                "audit",
                ViewBuilder::new(Selector::generic(), DenormFn::Merge).with_priority(2),
            )
            .view_builder(
                "persons",
                ViewBuilder::new(Selector::new("created").for_aggregate("person"), DenormFn::Merge)
                    .with_priority(1),
            )
            .event_extender(
                "persons",
                EventExtender::from_fn(Selector::new("created"), Ok),
            )
            .general_event_extender(EventExtender::from_fn(Selector::generic(), Ok))
            .build()
            .unwrap()
    }

    #[test]
    fn view_builders_are_gathered_per_collection_and_sorted() {
        let registry = create_test_registry();

        let found = registry.view_builders(&target("created", Some("person")));
        let order: Vec<_> = found
            .iter()
            .map(|b| (b.collection.name().to_string(), b.priority()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("persons".to_string(), Some(1)),
                ("audit".to_string(), Some(2)),
            ]
        );

        // Without an aggregate only the unscoped builder matches exactly.
        let found = registry.view_builders(&target("created", None));
        let order: Vec<_> = found.iter().map(|b| b.priority()).collect();
        assert_eq!(order, vec![Some(2), None]);
    }

    #[test]
    fn collection_extenders_win_over_general_ones() {
        let registry = create_test_registry();

        let ext = registry.event_extender(&target("created", None)).unwrap();
        assert_eq!(ext.collection.unwrap().name(), "persons");

        let ext = registry.event_extender(&target("deleted", None)).unwrap();
        assert!(ext.collection.is_none());
        assert!(registry.pre_event_extender(&target("created", None)).is_none());
    }

    #[test]
    fn duplicate_collection_names_are_rejected() {
        let result = Registry::builder()
            .collection(Collection::new("persons", InMemoryRepository::new()))
            .collection(Collection::new("persons", InMemoryRepository::new()))
            .build();
        assert!(matches!(result, Err(DenormalizerError::Config(_))));
    }

    #[test]
    fn bindings_to_unknown_collections_are_rejected() {
        let result = Registry::builder()
            .view_builder(
                "missing",
                ViewBuilder::new(Selector::new("created"), DenormFn::Merge),
            )
            .build();
        assert!(matches!(result, Err(DenormalizerError::Config(_))));
    }

    #[test]
    fn general_extenders_must_not_need_a_collection() {
        let result = Registry::builder()
            .general_event_extender(EventExtender::with_collection(
                Selector::generic(),
                |payload, _| async move { Ok(Event::new(payload)) },
            ))
            .build();
        assert!(matches!(result, Err(DenormalizerError::Config(_))));
    }

    #[test]
    fn info_lists_everything() {
        let info = create_test_registry().info();
        assert_eq!(info.collections.len(), 2);
        assert_eq!(info.collections[0].view_builders.len(), 2);
        assert!(info.collections[1].no_replay);
        assert_eq!(info.general_event_extenders.len(), 1);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["collections"][1]["noReplay"], serde_json::json!(true));
    }
}
