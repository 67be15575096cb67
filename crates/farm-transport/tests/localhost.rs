//! Integration tests: hub and endpoints on localhost.

use std::time::Duration;

use farm_transport::{BusConfig, BusEndpoint, BusHub, Publisher};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn config_for(hub: &BusHub) -> BusConfig {
    BusConfig::new()
        .sub_endpoint(format!("tcp://{}", hub.pub_addr()))
        .push_endpoint(format!("tcp://{}", hub.pull_addr()))
}

/// Wait until the hub has registered `n` subscribers for `channel`.
async fn wait_for_subscribers(hub: &BusHub, channel: &str, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.subscribers_for(channel) != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription never reached the hub");
}

#[tokio::test]
async fn push_reaches_subscriber_through_hub() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let mut bus = BusEndpoint::connect(config_for(&hub)).await.unwrap();
    assert!(bus.subscribe("ALL"));
    wait_for_subscribers(&hub, "ALL", 1).await;

    bus.publish("ALL", b"hello".to_vec());

    let (channel, data) = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv timed out")
        .expect("bus closed");
    assert_eq!(channel, "ALL");
    assert_eq!(data, b"hello");
}

#[tokio::test]
async fn unsubscribed_channel_is_not_delivered() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let mut bus = BusEndpoint::connect(config_for(&hub)).await.unwrap();
    bus.subscribe("group-a");
    bus.subscribe("group-b");
    wait_for_subscribers(&hub, "group-b", 1).await;

    assert!(bus.unsubscribe("group-a"));
    wait_for_subscribers(&hub, "group-a", 0).await;

    hub.publish("group-a", b"dropped");
    hub.publish("group-b", b"kept");

    let (channel, data) = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv timed out")
        .expect("bus closed");
    assert_eq!(channel, "group-b");
    assert_eq!(data, b"kept");
}

#[tokio::test]
async fn duplicate_subscribe_is_noop() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let bus = BusEndpoint::connect(config_for(&hub)).await.unwrap();

    assert!(bus.subscribe("solo"));
    assert!(!bus.subscribe("solo"));
    assert_eq!(bus.subscriptions(), vec!["solo".to_string()]);

    assert!(bus.unsubscribe("solo"));
    assert!(!bus.unsubscribe("solo"));
    assert!(!bus.is_subscribed("solo"));
}

#[tokio::test]
async fn publisher_order_is_preserved_per_channel() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let mut listener = BusEndpoint::connect(config_for(&hub)).await.unwrap();
    listener.subscribe("stream");
    wait_for_subscribers(&hub, "stream", 1).await;

    let publisher = Publisher::connect(&config_for(&hub)).await.unwrap();
    for i in 0u8..50 {
        publisher.publish("stream", vec![i]);
    }

    for expected in 0u8..50 {
        let (_, data) = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("recv timed out")
            .expect("bus closed");
        assert_eq!(data, vec![expected]);
    }
}

#[tokio::test]
async fn redundant_hubs_skip_the_unreachable_one() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let config = BusConfig::new()
        .sub_endpoint(format!("tcp://{dead_addr}"))
        .sub_endpoint(format!("tcp://{}", hub.pub_addr()))
        .push_endpoint(format!("tcp://{dead_addr}"))
        .push_endpoint(format!("tcp://{}", hub.pull_addr()))
        .connect_timeout(Duration::from_millis(500));

    let mut bus = BusEndpoint::connect(config).await.unwrap();
    assert_eq!(bus.publisher().connection_count(), 1);

    bus.subscribe("ALL");
    wait_for_subscribers(&hub, "ALL", 1).await;
    bus.publish("ALL", b"via the live hub".to_vec());

    let (_, data) = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv timed out")
        .expect("bus closed");
    assert_eq!(data, b"via the live hub");
}

#[tokio::test]
async fn oversized_publish_is_dropped_and_the_connection_survives() {
    init_tracing();
    let hub = BusHub::bind_with("127.0.0.1:0", "127.0.0.1:0", 512).await.unwrap();

    let mut bus = BusEndpoint::connect(config_for(&hub).max_frame_size(512))
        .await
        .unwrap();
    bus.subscribe("ALL");
    wait_for_subscribers(&hub, "ALL", 1).await;

    bus.publish("ALL", vec![0u8; 2048]);
    bus.publish("ALL", b"after".to_vec());

    let (_, data) = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv timed out")
        .expect("bus closed");
    assert_eq!(data, b"after");
}

#[tokio::test]
async fn subscriptions_are_replayed_after_the_hub_restarts() {
    init_tracing();
    let mut hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let pub_addr = hub.pub_addr().to_string();
    let pull_addr = hub.pull_addr().to_string();

    let config = config_for(&hub).reconnect_interval(Duration::from_millis(50));
    let mut bus = BusEndpoint::connect(config).await.unwrap();
    bus.subscribe("ALL");
    bus.subscribe("group-a");
    wait_for_subscribers(&hub, "group-a", 1).await;

    hub.shutdown();
    drop(hub);

    let hub = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match BusHub::bind(&pub_addr, &pull_addr).await {
                Ok(hub) => return hub,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("could not rebind the hub");

    wait_for_subscribers(&hub, "ALL", 1).await;
    wait_for_subscribers(&hub, "group-a", 1).await;
    assert_eq!(hub.publish("group-a", b"again"), 1);

    let (channel, data) = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv timed out")
        .expect("bus closed");
    assert_eq!(channel, "group-a");
    assert_eq!(data, b"again");
}

#[tokio::test]
async fn recv_ends_once_every_upstream_is_given_up() {
    init_tracing();
    let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let config = config_for(&hub)
        .connect_timeout(Duration::from_millis(200))
        .reconnect_interval(Duration::from_millis(20))
        .max_reconnect_attempts(Some(3));
    let mut bus = BusEndpoint::connect(config).await.unwrap();
    bus.subscribe("ALL");
    wait_for_subscribers(&hub, "ALL", 1).await;

    drop(hub);

    let next = tokio::time::timeout(Duration::from_secs(5), bus.recv())
        .await
        .expect("recv never gave up");
    assert!(next.is_none());
}
