
use aulacore::cache::SubscriptionCache;
use aulacore::store::{QuerySpec, StoreError};
use test_support::{collect_events, doc, is_error, snapshot_ids, FakeStore};

fn messages_query() -> QuerySpec {
    QuerySpec::collection("messages")
}

#[test]
fn store_errors_surface_to_every_consumer_and_keep_the_entry() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::new(store.clone());

    let (events_a, on_a) = collect_events();
    let (events_b, on_b) = collect_events();
    let _handle_a = cache.subscribe(&messages_query(), on_a).expect("subscribe a");
    let _handle_b = cache.subscribe(&messages_query(), on_b).expect("subscribe b");

    store.push_error_to_all(StoreError::new("permission_denied", "rules rejected the read"));

    assert!(is_error(&events_a.lock().unwrap()[0]));
    assert!(is_error(&events_b.lock().unwrap()[0]));

    // Not auto-evicted: a later subscribe may retry.
    assert_eq!(cache.entry_count(), 1);
    let entry = &cache.entries()[0];
    assert!(entry.errored);
    assert_eq!(entry.listener_count, 2);
}

#[test]
fn subscribing_to_an_errored_entry_reopens_a_clean_connection() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::new(store.clone());

    let (events_a, on_a) = collect_events();
    let _handle_a = cache.subscribe(&messages_query(), on_a).expect("subscribe a");
    store.push_error_to_all(StoreError::new("unavailable", "backend restarting"));
    assert_eq!(store.live_count(), 1);

    let (events_b, on_b) = collect_events();
    let _handle_b = cache.subscribe(&messages_query(), on_b).expect("retry subscribe");

    assert_eq!(store.open_count(), 2, "the retry opens a fresh subscription");
    assert_eq!(store.live_count(), 1, "the dead subscription was closed first");
    assert!(
        events_b.lock().unwrap().is_empty(),
        "no stale error or snapshot replays into the retry"
    );
    assert!(!cache.entries()[0].errored);

    store.push_to_all(vec![doc("m1")]);
    assert_eq!(snapshot_ids(events_a.lock().unwrap().last().unwrap()), vec!["m1"]);
    assert_eq!(snapshot_ids(events_b.lock().unwrap().last().unwrap()), vec!["m1"]);
}

#[test]
fn failed_open_surfaces_on_the_error_channel() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::new(store.clone());

    store.fail_next_open();
    let (events, on_change) = collect_events();
    let _handle = cache
        .subscribe(&messages_query(), on_change)
        .expect("subscribe returns a handle even when the open fails");

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(is_error(&events[0]));
    drop(events);
    assert!(cache.entries()[0].errored);
}

#[test]
fn errored_entries_evict_normally_when_all_consumers_leave() {
    let store = FakeStore::new();
    let cache = SubscriptionCache::new(store.clone());

    let (_events, on_change) = collect_events();
    let handle = cache.subscribe(&messages_query(), on_change).expect("subscribe");
    store.push_error_to_all(StoreError::new("permission_denied", "denied"));

    handle.unsubscribe();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(store.live_count(), 0);
}
