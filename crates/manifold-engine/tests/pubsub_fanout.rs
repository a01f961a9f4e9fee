mod common;

use common::*;
use manifold_engine::{ChannelOptions, EngineError};
use manifold_harness::{MessageKind, MockStore};

#[tokio::test]
async fn publish_reaches_local_subscriber() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, mut events) = engine_for(&[&store]);

    engine.subscribe("news").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("news")).await;

    engine
        .publish("news", b"hello", &ChannelOptions::default())
        .await
        .await
        .expect("publish reply")
        .expect("publish ok");

    let message = next_client_message(&mut events).await;
    assert_eq!(message.kind, MessageKind::Publication);
    assert_eq!(message.channel, "news");
    assert_eq!(&message.payload[..], b"hello");
}

#[tokio::test]
async fn publish_on_one_node_reaches_subscriber_on_another() {
    let store = MockStore::spawn().await.expect("store");
    let (subscriber_engine, _node_a, mut events_a) = engine_for(&[&store]);
    let (publisher_engine, _node_b, mut events_b) = engine_for(&[&store]);

    subscriber_engine.subscribe("chat").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("chat")).await;

    publisher_engine
        .publish("chat", b"cross-node", &ChannelOptions::default())
        .await
        .await
        .expect("publish reply")
        .expect("publish ok");

    let message = next_client_message(&mut events_a).await;
    assert_eq!(message.channel, "chat");
    assert_eq!(&message.payload[..], b"cross-node");
    // The publishing node never subscribed locally.
    assert_no_client_message(&mut events_b).await;
}

#[tokio::test]
async fn fanout_across_two_shards_delivers_exactly_once() {
    let store_one = MockStore::spawn().await.expect("store one");
    let store_two = MockStore::spawn().await.expect("store two");
    let (node_a_engine, _node_a, mut events_a) = engine_for(&[&store_one, &store_two]);
    let (node_b_engine, _node_b, _events_b) = engine_for(&[&store_one, &store_two]);

    node_a_engine.subscribe("a").await.expect("subscribe");
    // Both engines hash "a" to the same shard index, so the subscribe and
    // the publish meet on the same store; wait on whichever got it.
    let channel = store_channel("a");
    for _ in 0..200 {
        if store_one.subscriber_count(&channel) + store_two.subscriber_count(&channel) > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    node_b_engine
        .publish("a", b"hello", &ChannelOptions::default())
        .await
        .await
        .expect("publish reply")
        .expect("publish ok");

    let message = next_client_message(&mut events_a).await;
    assert_eq!(message.channel, "a");
    assert_eq!(&message.payload[..], b"hello");
    assert_no_client_message(&mut events_a).await;
}

#[tokio::test]
async fn same_channel_publishes_arrive_in_order() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, mut events) = engine_for(&[&store]);

    engine.subscribe("ordered").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("ordered")).await;

    let first = engine
        .publish("ordered", b"m1", &ChannelOptions::default())
        .await;
    let second = engine
        .publish("ordered", b"m2", &ChannelOptions::default())
        .await;
    first.await.expect("reply").expect("m1 ok");
    second.await.expect("reply").expect("m2 ok");

    assert_eq!(&next_client_message(&mut events).await.payload[..], b"m1");
    assert_eq!(&next_client_message(&mut events).await.payload[..], b"m2");
}

#[tokio::test]
async fn join_and_leave_travel_with_their_kinds() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, mut events) = engine_for(&[&store]);

    engine.subscribe("room").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("room")).await;

    engine
        .publish_join("room", b"who")
        .await
        .await
        .expect("reply")
        .expect("join ok");
    engine
        .publish_leave("room", b"who")
        .await
        .await
        .expect("reply")
        .expect("leave ok");

    assert_eq!(next_client_message(&mut events).await.kind, MessageKind::Join);
    assert_eq!(
        next_client_message(&mut events).await.kind,
        MessageKind::Leave
    );
}

#[tokio::test]
async fn control_commands_fan_out_to_every_node() {
    let store = MockStore::spawn().await.expect("store");
    let (engine_a, _node_a, mut events_a) = engine_for(&[&store]);
    let (_engine_b, _node_b, mut events_b) = engine_for(&[&store]);

    // Both nodes subscribe the control channel on startup.
    let control = format!("{PREFIX}.control");
    for _ in 0..200 {
        if store.subscriber_count(&control) >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    engine_a
        .publish_control(b"reload")
        .await
        .await
        .expect("reply")
        .expect("control ok");

    let seen_a = tokio::time::timeout(std::time::Duration::from_secs(2), events_a.control.recv())
        .await
        .expect("node a control timeout")
        .expect("node a control sink");
    let seen_b = tokio::time::timeout(std::time::Duration::from_secs(2), events_b.control.recv())
        .await
        .expect("node b control timeout")
        .expect("node b control sink");
    assert_eq!(&seen_a[..], b"reload");
    assert_eq!(&seen_b[..], b"reload");
}

#[tokio::test]
async fn encode_failures_surface_before_the_pipeline() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, node, _events) = engine_for(&[&store]);

    node.set_fail_encode(true);
    let err = engine
        .publish("news", b"payload", &ChannelOptions::default())
        .await
        .await
        .expect("reply")
        .expect_err("encode must fail");
    assert!(matches!(err, EngineError::Encode(_)));
}

#[tokio::test]
async fn hub_channels_are_resubscribed_on_startup() {
    let store = MockStore::spawn().await.expect("store");
    let (node, events) = manifold_harness::TestNode::new();
    node.add_hub_channel("restored");
    let config = manifold_engine::EngineConfig::single(shard_config(&store));
    let engine = manifold_engine::Engine::new(
        std::sync::Arc::clone(&node) as std::sync::Arc<dyn manifold_engine::Node>,
        config,
    )
    .expect("engine");
    engine.run().expect("run");
    drop(events);

    // The initial subscription list includes hub channels without any
    // explicit subscribe call.
    wait_for_subscriber(&store, &store_channel("restored")).await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let store = MockStore::spawn().await.expect("store");
    let (engine, _node, mut events) = engine_for(&[&store]);

    engine.subscribe("ephemeral").await.expect("subscribe");
    wait_for_subscriber(&store, &store_channel("ephemeral")).await;
    engine.unsubscribe("ephemeral").await.expect("unsubscribe");
    for _ in 0..200 {
        if store.subscriber_count(&store_channel("ephemeral")) == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    engine
        .publish("ephemeral", b"gone", &ChannelOptions::default())
        .await
        .await
        .expect("reply")
        .expect("publish ok");
    assert_no_client_message(&mut events).await;
}
