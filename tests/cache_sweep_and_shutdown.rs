
use std::time::Duration;

use aulacore::cache::{CacheConfig, SubscriptionCache};
use aulacore::store::QuerySpec;
use test_support::{collect_events, doc, FakeStore};

fn query(collection: &str) -> QuerySpec {
    QuerySpec::collection(collection)
}

#[test]
fn sweep_never_evicts_entries_with_listeners() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::with_config(
        store.clone(),
        CacheConfig {
            staleness_window: Duration::ZERO,
            max_entries: 1,
        },
    );

    let (_e1, on_1) = collect_events();
    let (_e2, on_2) = collect_events();
    let (_e3, on_3) = collect_events();
    let _h1 = cache.subscribe(&query("students"), on_1).expect("subscribe");
    let _h2 = cache.subscribe(&query("grades"), on_2).expect("subscribe");
    let _h3 = cache.subscribe(&query("alerts"), on_3).expect("subscribe");

    // Every entry is both over cap and instantly stale, yet all have a
    // listener, so the sweep must leave them alone.
    assert_eq!(cache.sweep(), 0);
    assert_eq!(cache.entry_count(), 3);
    assert_eq!(store.live_count(), 3);
}

#[test]
fn shutdown_closes_everything_and_rejects_new_subscribes() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::new(store.clone());

    let (events, on_change) = collect_events();
    let _handle = cache.subscribe(&query("students"), on_change).expect("subscribe");
    store.push_to_all(vec![doc("s1")]);
    assert_eq!(events.lock().unwrap().len(), 1);

    cache.shutdown();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(store.live_count(), 0);

    let err = cache
        .subscribe(&query("students"), |_| {})
        .err()
        .expect("subscribe after shutdown must fail");
    assert_eq!(err.code, "cache_shut_down");
    assert_eq!(events.lock().unwrap().len(), 1, "no deliveries after shutdown");
}
