#![allow(dead_code)]

use serde_json::{json, Value};
use skybus::{Args, Bus, BusConfig, BusError, BusState, Endpoint, HandlerError, HostedObject, ResourceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

pub fn free_endpoint() -> Endpoint {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port())
}

pub fn fast_config() -> BusConfig {
    BusConfig {
        request_timeout_ms: 5_000,
        ping_timeout_ms: 1_000,
        loop_tick_ms: 50,
        shutdown_grace_ms: 500,
        response_ttl_ms: 2_000,
        ..BusConfig::default()
    }
}

/// Test double for an instrument: fixed azimuth, echo, slow, failing and panicking methods.
pub fn telescope() -> HostedObject {
    HostedObject::new()
        .method("get_az", |_: &Args| Ok(json!(42.0)))
        .method("echo", |args: &Args| args.arg::<Value>(0))
        .method("sleep", |args: &Args| {
            let ms: u64 = args.arg(0)?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .method("fail", |_: &Args| Err(HandlerError::new("ValueError", "bad azimuth")))
        .method("explode", |_: &Args| -> Result<Value, HandlerError> { panic!("motor stalled") })
}

pub fn registry() -> Arc<ResourceRegistry> {
    let registry = Arc::new(ResourceRegistry::new());
    registry.add("/Telescope/main", telescope()).unwrap();
    registry
}

pub async fn start_bus(config: BusConfig) -> (Arc<Bus>, JoinHandle<Result<(), BusError>>) {
    let bus = Arc::new(Bus::new(free_endpoint(), config));
    bus.set_resolver(registry());

    let server = Arc::clone(&bus);
    let handle = tokio::spawn(async move { server.run_forever().await });

    let running = Arc::clone(&bus);
    assert!(wait_until(Duration::from_secs(2), || running.state() == BusState::Running).await);
    (bus, handle)
}

/// Serve again on `endpoint` once the previous listener released it.
pub async fn restart_bus(
    endpoint: Endpoint,
    config: BusConfig,
) -> (Arc<Bus>, JoinHandle<Result<(), BusError>>) {
    let bus = Arc::new(Bus::new(endpoint, config));
    bus.set_resolver(registry());

    let deadline = Instant::now() + Duration::from_secs(2);
    while let Err(e) = bus.bind().await {
        assert!(Instant::now() < deadline, "could not rebind: {}", e);
        time::sleep(Duration::from_millis(50)).await;
    }

    let server = Arc::clone(&bus);
    let handle = tokio::spawn(async move { server.run_forever().await });

    let running = Arc::clone(&bus);
    assert!(wait_until(Duration::from_secs(2), || running.state() == BusState::Running).await);
    (bus, handle)
}

pub fn client_bus(config: BusConfig) -> Bus {
    Bus::new(free_endpoint(), config)
}

pub async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
