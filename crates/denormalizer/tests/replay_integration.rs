//! End-to-end replay behavior: buffering, dedup, ordering and checkpoints.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use denormalizer::{
    Collection, DenormFn, Denormalizer, DenormalizerError, Event, EventDefinition, EventExtender,
    InMemoryRepository, InMemoryRevisionStore, Registry, RevisionGuardStore, Selector,
    ViewBuilder,
};
use serde_json::{Value, json};
use view_store::ViewModelRepositoryExt;

fn definition() -> EventDefinition {
    EventDefinition::new()
        .with_aggregate_id("aggregate.id")
        .with_aggregate("aggregate.name")
        .with_context("context.name")
        .with_revision("revision")
}

fn create_test_event(
    id: &str,
    name: &str,
    aggregate: &str,
    aggregate_id: &str,
    revision: u64,
) -> Event {
    Event::new(json!({
        "id": id,
        "name": name,
        "aggregate": {"id": aggregate_id, "name": aggregate},
        "context": {"name": "ctx"},
        "revision": revision,
        "payload": {"revision": revision}
    }))
}

fn counter() -> DenormFn {
    DenormFn::apply(|payload, vm, _| {
        let count = vm.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
        vm.set("count", json!(count + 1));
        vm.set("lastRevision", payload["revision"].clone());
        Ok(())
    })
}

struct Fixture {
    denormalizer: Denormalizer,
    store: InMemoryRevisionStore,
    counters: InMemoryRepository,
    audit: InMemoryRepository,
}

fn create_fixture() -> Fixture {
    let store = InMemoryRevisionStore::new();
    let counters = InMemoryRepository::new();
    let audit = InMemoryRepository::new();
    let registry = Registry::builder()
        .collection(Collection::new("counters", counters.clone()).with_default_payload("payload"))
        .collection(Collection::new("audit", audit.clone()).no_replay())
        .view_builder(
            "counters",
            ViewBuilder::new(Selector::new("counted"), counter()).with_id_path("aggregate.id"),
        )
        .view_builder(
            "audit",
            ViewBuilder::new(Selector::new("counted"), DenormFn::Merge).with_id_path("id"),
        )
        .build()
        .unwrap();
    let denormalizer = Denormalizer::builder(registry, store.clone())
        .event_definition(definition())
        .build();
    Fixture {
        denormalizer,
        store,
        counters,
        audit,
    }
}

async fn count_of(repo: &InMemoryRepository, id: &str) -> Option<Value> {
    repo.get_if_exists(id)
        .await
        .unwrap()
        .and_then(|vm| vm.get("count"))
}

#[tokio::test]
async fn checkpoints_are_one_past_highest_revision_per_aggregate() {
    let fixture = create_fixture();

    fixture
        .denormalizer
        .replay(vec![
            create_test_event("e1", "counted", "agg1", "aggId1", 1),
            create_test_event("e2", "counted", "agg1", "aggId1", 2),
            create_test_event("e3", "counted", "agg1", "aggId1", 3),
            create_test_event("e4", "counted", "agg2", "aggId2", 4),
            create_test_event("e5", "counted", "agg2", "aggId2", 5),
        ])
        .await
        .unwrap();

    assert_eq!(fixture.store.get("ctxagg1aggId1").await.unwrap(), Some(4));
    assert_eq!(fixture.store.get("ctxagg2aggId2").await.unwrap(), Some(6));
    assert_eq!(count_of(&fixture.counters, "aggId1").await, Some(json!(3)));
    assert_eq!(count_of(&fixture.counters, "aggId2").await, Some(json!(2)));
}

#[tokio::test]
async fn no_replay_collections_are_left_alone() {
    let fixture = create_fixture();

    fixture
        .denormalizer
        .replay(vec![create_test_event("e1", "counted", "agg1", "aggId1", 1)])
        .await
        .unwrap();

    assert!(fixture.audit.is_empty().await);
    let audit = fixture.denormalizer.registry().collection("audit").unwrap();
    assert!(!audit.is_replaying());
}

#[tokio::test]
async fn duplicate_events_are_denormalized_once() {
    let fixture = create_fixture();
    let event = create_test_event("e1", "counted", "agg1", "aggId1", 1);

    fixture
        .denormalizer
        .replay(vec![event.clone(), event.clone(), event])
        .await
        .unwrap();

    assert_eq!(count_of(&fixture.counters, "aggId1").await, Some(json!(1)));
}

#[tokio::test]
async fn events_are_applied_in_feed_order() {
    let fixture = create_fixture();

    let mut session = fixture.denormalizer.replay_streamed();
    for revision in 1..=20 {
        session.replay(create_test_event(
            &format!("e{revision}"),
            "counted",
            "agg1",
            "aggId1",
            revision,
        ));
    }
    session.done().await.unwrap();

    let vm = fixture.counters.get_if_exists("aggId1").await.unwrap().unwrap();
    assert_eq!(vm.get("count"), Some(json!(20)));
    assert_eq!(vm.get("lastRevision"), Some(json!(20)));
}

#[tokio::test]
async fn last_event_is_saved_for_resuming() {
    let fixture = create_fixture();

    fixture
        .denormalizer
        .replay(vec![
            create_test_event("e1", "counted", "agg1", "aggId1", 1),
            create_test_event("e2", "unknown", "agg1", "aggId1", 2),
        ])
        .await
        .unwrap();

    let last = fixture.denormalizer.get_last_event().await.unwrap().unwrap();
    assert_eq!(last.get("id"), Some(&json!("e2")));
}

#[tokio::test]
async fn replay_from_stream() {
    let fixture = create_fixture();
    let events = (1..=3).map(|revision| {
        create_test_event(&format!("e{revision}"), "counted", "agg1", "aggId1", revision)
    });

    fixture
        .denormalizer
        .replay_stream(futures_util::stream::iter(events))
        .await
        .unwrap();

    assert_eq!(count_of(&fixture.counters, "aggId1").await, Some(json!(3)));
    assert_eq!(fixture.store.get("ctxagg1aggId1").await.unwrap(), Some(4));
}

#[tokio::test]
async fn errors_are_collected_and_the_run_completes() {
    let repo = InMemoryRepository::new();
    let registry = Registry::builder()
        .collection(Collection::new("counters", repo.clone()).with_default_payload("payload"))
        .view_builder(
            "counters",
            ViewBuilder::new(
                Selector::new("counted"),
                DenormFn::apply(|payload, vm, _| {
                    if payload["revision"] == json!(2) {
                        return Err("revision 2 is poisoned".into());
                    }
                    vm.set("lastRevision", payload["revision"].clone());
                    Ok(())
                }),
            )
            .with_id_path("aggregate.id"),
        )
        .build()
        .unwrap();
    let store = InMemoryRevisionStore::new();
    let denormalizer = Denormalizer::builder(registry, store.clone())
        .event_definition(definition())
        .build();

    let errors = denormalizer
        .replay((1..=3).map(|revision| {
            create_test_event(&format!("e{revision}"), "counted", "agg1", "aggId1", revision)
        }))
        .await
        .unwrap_err();

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(DenormalizerError::Projection { .. })
    ));
    let vm = repo.get_if_exists("aggId1").await.unwrap().unwrap();
    assert_eq!(vm.get("lastRevision"), Some(json!(3)));
    assert_eq!(store.get("ctxagg1aggId1").await.unwrap(), Some(4));
}

#[tokio::test]
async fn prioritized_builders_run_one_task_each_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let builder = |label: &'static str, priority: u32, delay: Duration| {
        let log = Arc::clone(&log);
        ViewBuilder::new(
            Selector::new("counted"),
            DenormFn::apply_async(move |_, vm, _| {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    log.lock().unwrap().push(label);
                    vm.set("by", json!(label));
                    Ok(())
                })
            }),
        )
        .with_id_path("aggregate.id")
        .with_priority(priority)
    };
    let registry = Registry::builder()
        .collection(Collection::new("a", InMemoryRepository::new()))
        .collection(Collection::new("b", InMemoryRepository::new()))
        .view_builder("b", builder("late", 2, Duration::ZERO))
        .view_builder("a", builder("early", 1, Duration::from_millis(20)))
        .build()
        .unwrap();
    let denormalizer = Denormalizer::builder(registry, InMemoryRevisionStore::new())
        .event_definition(definition())
        .build();

    denormalizer
        .replay(vec![
            create_test_event("e1", "counted", "agg1", "aggId1", 1),
            create_test_event("e2", "counted", "agg1", "aggId1", 2),
        ])
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["early", "late", "early", "late"]);
}

#[tokio::test]
async fn pre_event_extender_runs_before_replayed_builders() {
    let repo = InMemoryRepository::new();
    let registry = Registry::builder()
        .collection(Collection::new("counters", repo.clone()))
        .view_builder(
            "counters",
            ViewBuilder::new(Selector::new("counted"), DenormFn::Merge)
                .with_id_path("aggregate.id")
                .with_payload("payload"),
        )
        .pre_event_extender(
            "counters",
            EventExtender::from_fn(Selector::new("counted"), |event| {
                Ok(event.with("payload.extended", json!(true)))
            }),
        )
        .build()
        .unwrap();
    let denormalizer = Denormalizer::builder(registry, InMemoryRevisionStore::new())
        .event_definition(definition())
        .build();

    denormalizer
        .replay(vec![create_test_event("e1", "counted", "agg1", "aggId1", 1)])
        .await
        .unwrap();

    let vm = repo.get_if_exists("aggId1").await.unwrap().unwrap();
    assert_eq!(vm.get("extended"), Some(json!(true)));
}

#[tokio::test]
async fn clear_resets_replayable_state_only() {
    let fixture = create_fixture();
    fixture
        .denormalizer
        .handle(create_test_event("e1", "counted", "agg1", "aggId1", 1))
        .await
        .unwrap();
    assert!(!fixture.audit.is_empty().await);

    fixture.denormalizer.clear().await.unwrap();

    assert!(fixture.counters.is_empty().await);
    assert!(!fixture.audit.is_empty().await);
    assert_eq!(fixture.store.get("ctxagg1aggId1").await.unwrap(), None);
}
