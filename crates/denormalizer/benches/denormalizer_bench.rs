use criterion::{Criterion, criterion_group, criterion_main};
use denormalizer::{
    Collection, DenormFn, Denormalizer, Event, EventDefinition, InMemoryRepository,
    InMemoryRevisionStore, Registry, Selector, ViewBuilder,
};
use serde_json::json;

fn create_denormalizer() -> Denormalizer {
    let registry = Registry::builder()
        .collection(
            Collection::new("orders", InMemoryRepository::new()).with_default_payload("payload"),
        )
        .collection(
            Collection::new("customers", InMemoryRepository::new())
                .with_default_payload("payload"),
        )
        .view_builder(
            "orders",
            ViewBuilder::new(Selector::new("orderPlaced"), DenormFn::Merge)
                .with_id_path("aggregate.id"),
        )
        .view_builder(
            "customers",
            ViewBuilder::new(
                Selector::new("orderPlaced"),
                DenormFn::apply(|_, vm, _| {
                    let orders = vm.get("orders").and_then(|v| v.as_u64()).unwrap_or(0);
                    vm.set("orders", json!(orders + 1));
                    Ok(())
                }),
            )
            .with_id_path("payload.customerId"),
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

/// N orders spread over 10 customers, each order with 3 revisions.
fn order_events(n: usize) -> Vec<Event> {
    (0..n)
        .flat_map(|order| {
            (1..=3u64).map(move |revision| {
                Event::new(json!({
                    "id": format!("evt-{order}-{revision}"),
                    "name": "orderPlaced",
                    "aggregate": {"id": format!("order-{order}")},
                    "revision": revision,
                    "payload": {"customerId": format!("customer-{}", order % 10), "total": 100}
                }))
            })
        })
        .collect()
}

fn bench_replay_100_orders(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events = order_events(100);

    c.bench_function("denormalizer/replay_300_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let denormalizer = create_denormalizer();
                denormalizer.replay(events.clone()).await.unwrap();
            });
        });
    });
}

fn bench_replay_1000_orders(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events = order_events(1000);

    c.bench_function("denormalizer/replay_3000_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let denormalizer = create_denormalizer();
                denormalizer.replay(events.clone()).await.unwrap();
            });
        });
    });
}

fn bench_handle_live_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events = order_events(100);

    c.bench_function("denormalizer/handle_300_live_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let denormalizer = create_denormalizer();
                for event in events.clone() {
                    denormalizer.handle(event).await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_replay_100_orders,
    bench_replay_1000_orders,
    bench_handle_live_events,
);
criterion_main!(benches);
