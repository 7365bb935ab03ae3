//! Optimistic-concurrency behavior of the in-memory repository under
//! concurrent writers.

use serde_json::json;
use view_store::{
    InMemoryRepository, Query, QueryOptions, ViewModel, ViewModelRepository,
    ViewModelRepositoryExt,
};

async fn increment_with_retry(repo: InMemoryRepository, id: &str) -> u32 {
    let mut conflicts = 0;
    loop {
        let mut vm = repo.get(id).await.unwrap();
        let count = vm.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
        vm.set("count", json!(count + 1));
        tokio::task::yield_now().await;
        match repo.commit(vm).await {
            Ok(()) => return conflicts,
            Err(e) if e.is_concurrency_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_never_lose_updates() {
    let repo = InMemoryRepository::new();
    let mut seed = ViewModel::new("counter");
    seed.set("count", json!(0));
    repo.commit(seed).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { increment_with_retry(repo, "counter").await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let vm = repo.get_if_exists("counter").await.unwrap().unwrap();
    assert_eq!(vm.get("count"), Some(json!(20)));
    assert_eq!(vm.version(), 21);
}

#[tokio::test]
async fn delete_then_recreate_in_one_bulk() {
    let repo = InMemoryRepository::with_bulk_commit();
    let mut vm = ViewModel::new("vm-1");
    vm.set("generation", json!(1));
    repo.commit(vm).await.unwrap();

    let mut doomed = repo.get("vm-1").await.unwrap();
    doomed.destroy();
    let mut reborn = ViewModel::new("vm-1");
    reborn.set("generation", json!(2));

    repo.bulk_commit(vec![doomed, reborn]).await.unwrap();

    let found = repo
        .find(&Query::new().field("generation", 2), &QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].version(), 1);
}
