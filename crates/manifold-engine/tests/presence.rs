mod common;

use std::time::Duration;

use common::*;
use manifold_harness::MockStore;

#[tokio::test]
async fn add_then_read_round_trips() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "uid-1", b"alice", 30)
        .await
        .expect("add presence");
    engine
        .add_presence("room", "uid-2", b"bob", 30)
        .await
        .expect("add presence");

    let presence = engine.presence("room").await.expect("presence");
    assert_eq!(presence.len(), 2);
    assert_eq!(&presence["uid-1"][..], b"alice");
    assert_eq!(&presence["uid-2"][..], b"bob");
}

#[tokio::test]
async fn add_updates_existing_info() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "uid-1", b"v1", 30)
        .await
        .expect("add presence");
    engine
        .add_presence("room", "uid-1", b"v2", 30)
        .await
        .expect("refresh presence");

    let presence = engine.presence("room").await.expect("presence");
    assert_eq!(presence.len(), 1);
    assert_eq!(&presence["uid-1"][..], b"v2");
}

#[tokio::test]
async fn remove_clears_the_entry() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "uid-1", b"alice", 30)
        .await
        .expect("add presence");
    engine
        .remove_presence("room", "uid-1")
        .await
        .expect("remove presence");

    let presence = engine.presence("room").await.expect("presence");
    assert!(presence.is_empty());
    assert!(!store.hash_contains(&presence_hash_key("room"), "uid-1"));
}

#[tokio::test]
async fn reads_sweep_expired_entries() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "uid-1", b"alice", 1)
        .await
        .expect("add presence");
    assert_eq!(engine.presence("room").await.expect("presence").len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The read is the sweeper: the expired UID is evicted from both keys
    // before the map comes back.
    let presence = engine.presence("room").await.expect("presence");
    assert!(presence.is_empty());
    assert!(!store.hash_contains(&presence_hash_key("room"), "uid-1"));
}

#[tokio::test]
async fn non_positive_expiry_never_shows_up() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "uid-1", b"alice", 0)
        .await
        .expect("add presence");
    let presence = engine.presence("room").await.expect("presence");
    assert!(presence.is_empty());
}

#[tokio::test]
async fn expired_and_live_entries_are_separated() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .add_presence("room", "short", b"s", 1)
        .await
        .expect("add presence");
    engine
        .add_presence("room", "long", b"l", 60)
        .await
        .expect("add presence");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let presence = engine.presence("room").await.expect("presence");
    assert_eq!(presence.len(), 1);
    assert!(presence.contains_key("long"));
    assert!(!store.hash_contains(&presence_hash_key("room"), "short"));
}
