mod common;

use std::time::Duration;

use common::*;
use manifold_engine::{ChannelOptions, HistoryFilter};
use manifold_harness::MockStore;

fn history_opts(size: usize, lifetime_secs: u64) -> ChannelOptions {
    ChannelOptions {
        history_size: size,
        history_lifetime_secs: lifetime_secs,
        history_drop_inactive: false,
    }
}

#[tokio::test]
async fn history_keeps_newest_entries_up_to_size() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    let opts = history_opts(3, 60);
    for payload in [b"1".as_slice(), b"2", b"3", b"4"] {
        engine
            .publish("feed", payload, &opts)
            .await
            .await
            .expect("reply")
            .expect("publish ok");
    }

    let history = engine
        .history("feed", HistoryFilter::default())
        .await
        .expect("history");
    let payloads: Vec<bytes::Bytes> = history
        .iter()
        .map(|entry| {
            let envelope =
                manifold_harness::node::decode_envelope(entry.clone()).expect("envelope");
            assert_eq!(envelope.channel, "feed");
            envelope.payload
        })
        .collect();
    assert_eq!(payloads.len(), 3);
    assert_eq!(&payloads[0][..], b"4");
    assert_eq!(&payloads[1][..], b"3");
    assert_eq!(&payloads[2][..], b"2");
}

#[tokio::test]
async fn history_limit_returns_newest_first() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    let opts = history_opts(10, 60);
    for payload in [b"a".as_slice(), b"b", b"c"] {
        engine
            .publish("feed", payload, &opts)
            .await
            .await
            .expect("reply")
            .expect("publish ok");
    }

    let limited = engine
        .history("feed", HistoryFilter { limit: 2 })
        .await
        .expect("history");
    assert_eq!(limited.len(), 2);
    assert_eq!(&limited[0][limited[0].len() - 1..], b"c");
    assert_eq!(&limited[1][limited[1].len() - 1..], b"b");

    let unbounded = engine
        .history("feed", HistoryFilter { limit: 0 })
        .await
        .expect("history");
    assert_eq!(unbounded.len(), 3);
}

#[tokio::test]
async fn history_expires_with_its_lifetime() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .publish("volatile", b"soon-gone", &history_opts(5, 1))
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    assert_eq!(
        engine
            .history("volatile", HistoryFilter::default())
            .await
            .expect("history")
            .len(),
        1
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(
        engine
            .history("volatile", HistoryFilter::default())
            .await
            .expect("history")
            .is_empty()
    );
}

#[tokio::test]
async fn publishes_without_history_options_skip_the_list() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    engine
        .publish("plain", b"payload", &ChannelOptions::default())
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    assert!(store.list_entries(&history_key("plain")).is_empty());
}

#[tokio::test]
async fn drop_inactive_skips_history_until_a_subscribe_touches() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, node, _events) = engine_for(&[&store]);

    let opts = ChannelOptions {
        history_size: 3,
        history_lifetime_secs: 60,
        history_drop_inactive: true,
    };
    node.set_channel_options("lazy", opts);

    // Nobody subscribed anywhere: the publish is delivered to pub/sub but
    // must not seed the history list.
    engine
        .publish("lazy", b"first", &opts)
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    assert!(store.list_entries(&history_key("lazy")).is_empty());

    engine.subscribe("lazy").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("lazy")).await;
    assert!(store.key_exists(&touch_key("lazy")), "subscribe touches");

    engine
        .publish("lazy", b"second", &opts)
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    let entries = store.list_entries(&history_key("lazy"));
    assert_eq!(entries.len(), 1);
    assert_eq!(&entries[0][entries[0].len() - 6..], b"second");
}

#[tokio::test]
async fn unsubscribe_refreshes_the_touch_key() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, node, _events) = engine_for(&[&store]);

    let opts = ChannelOptions {
        history_size: 3,
        history_lifetime_secs: 60,
        history_drop_inactive: true,
    };
    node.set_channel_options("lazy", opts);

    engine.subscribe("lazy").await.expect("subscribe");
    engine.unsubscribe("lazy").await.expect("unsubscribe");
    // The unsubscribe path blocks on the touch, so the key is visible as
    // soon as the call returns.
    assert!(store.key_exists(&touch_key("lazy")));
}

#[tokio::test]
async fn script_flush_recovers_after_one_failed_publish() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    let opts = history_opts(3, 60);
    engine
        .publish("feed", b"before", &opts)
        .await
        .await
        .expect("reply")
        .expect("publish ok");

    store.script_flush();

    let err = engine
        .publish("feed", b"during", &opts)
        .await
        .await
        .expect("reply")
        .expect_err("script is gone");
    assert!(err.is_no_script(), "unexpected error: {err}");

    // The pipeline restarts and reloads the script; the next publish is
    // served normally.
    engine
        .publish("feed", b"after", &opts)
        .await
        .await
        .expect("reply")
        .expect("publish recovers");
    let history = engine
        .history("feed", HistoryFilter::default())
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn remove_history_is_an_accepted_stub() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, _events) = engine_for(&[&store]);

    let opts = history_opts(3, 60);
    engine
        .publish("kept", b"entry", &opts)
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    engine.remove_history("kept").await.expect("stub succeeds");
    // Deferred upstream: nothing was deleted.
    assert_eq!(store.list_entries(&history_key("kept")).len(), 1);
}
