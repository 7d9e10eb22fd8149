mod common;

use common::*;
use skybus::*;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_live_bus() {
    let (server, _handle) = start_bus(fast_config()).await;
    let client = client_bus(fast_config());
    let src = client.object_url("Client", None).unwrap();
    let dst = server.object_url("Telescope", Some("main")).unwrap();

    let pong = client.ping(&src, &dst).await.expect("live bus answers");
    assert!(pong.ok);
    assert_eq!(pong.src, dst);
    assert_eq!(pong.dst, src);

    // loopback
    assert!(server.ping(&dst, &dst).await.is_some());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_never_bound() {
    let config = fast_config();
    let client = client_bus(config.clone());
    let src = client.object_url("Client", None).unwrap();
    let dst = create_url(&free_endpoint(), "Telescope", Some("main")).unwrap();

    let started = Instant::now();
    assert!(client.ping(&src, &dst).await.is_none());
    assert!(started.elapsed() < config.ping_timeout() + Duration::from_millis(500));
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_bound_but_not_serving() {
    let config = fast_config();
    let idle = Bus::new(free_endpoint(), config.clone());
    idle.bind().await.unwrap();
    assert_eq!(idle.state(), BusState::Bound);

    let client = client_bus(config.clone());
    let src = client.object_url("Client", None).unwrap();
    let dst = idle.object_url("Telescope", Some("main")).unwrap();

    let started = Instant::now();
    assert!(client.ping(&src, &dst).await.is_none());
    assert!(started.elapsed() < config.ping_timeout() + Duration::from_millis(500));

    client.shutdown().await;
    idle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_own_endpoint_does_not_bind() {
    let bus = Bus::new(free_endpoint(), fast_config());
    let me = bus.object_url("Telescope", Some("main")).unwrap();

    assert!(bus.ping(&me, &me).await.is_none());
    assert_eq!(bus.state(), BusState::Created);

    bus.bind().await.unwrap();
    assert_eq!(bus.state(), BusState::Bound);
    bus.shutdown().await;
}
