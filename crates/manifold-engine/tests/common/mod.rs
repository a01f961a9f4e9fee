#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use manifold_engine::{Engine, EngineConfig, Node, ShardConfig};
use manifold_harness::{ClientEnvelope, MockStore, TestNode, TestNodeEvents};

pub const PREFIX: &str = "manifold";

pub fn shard_config(store: &MockStore) -> ShardConfig {
    ShardConfig {
        host: store.host(),
        port: store.port(),
        pool_size: 4,
        read_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..ShardConfig::default()
    }
}

/// Engine wired to the given stores (one shard per store), already running.
pub fn engine_for(stores: &[&MockStore]) -> (Engine, Arc<TestNode>, TestNodeEvents) {
    let (node, events) = TestNode::new();
    let config = EngineConfig {
        shards: stores.iter().map(|store| shard_config(store)).collect(),
    };
    let engine =
        Engine::new(Arc::clone(&node) as Arc<dyn Node>, config).expect("construct engine");
    engine.run().expect("run engine");
    (engine, node, events)
}

pub fn store_channel(channel: &str) -> String {
    format!("{PREFIX}.client.{channel}")
}

pub fn history_key(channel: &str) -> String {
    format!("{PREFIX}.history.list.{channel}")
}

pub fn touch_key(channel: &str) -> String {
    format!("{PREFIX}.history.touch.{channel}")
}

pub fn presence_hash_key(channel: &str) -> String {
    format!("{PREFIX}.presence.data.{channel}")
}

/// Waits until the store sees a subscriber on the store-level channel.
/// Subscribe acks only confirm the command was written, so tests that
/// publish right after subscribing need this barrier.
pub async fn wait_for_subscriber(store: &MockStore, store_level_channel: &str) {
    for _ in 0..200 {
        if store.subscriber_count(store_level_channel) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no subscriber appeared on {store_level_channel}");
}

pub async fn next_client_message(events: &mut TestNodeEvents) -> ClientEnvelope {
    tokio::time::timeout(Duration::from_secs(2), events.client.recv())
        .await
        .expect("timed out waiting for client message")
        .expect("client sink closed")
}

pub async fn assert_no_client_message(events: &mut TestNodeEvents) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), events.client.recv()).await;
    assert!(outcome.is_err(), "unexpected extra client message");
}
