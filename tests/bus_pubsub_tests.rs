mod common;

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use skybus::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn recorder(id: &str) -> (Callback, Arc<Mutex<Vec<i64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = Callback::new(id, move |args: &Args| {
        if let Ok(value) = args.arg::<i64>(0) {
            sink.lock().push(value);
        }
    });
    (callback, seen)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_is_idempotent_on_both_sides() {
    let (publisher, _handle) = start_bus(fast_config()).await;
    let subscriber = client_bus(fast_config());

    let dome = publisher.object_url("Dome", Some("main")).unwrap();
    let sub = subscriber.object_url("Scheduler", Some("main")).unwrap();
    let event_id = EventId::new(&dome, "opened");
    let (callback, _seen) = recorder("on_opened");

    subscriber.subscribe(&sub, &dome, "opened", callback.clone()).await.unwrap();
    subscriber.subscribe(&sub, &dome, "opened", callback.clone()).await.unwrap();

    assert_eq!(
        subscriber.callbacks(&event_id),
        vec![Subscriber::new(&sub, &CallbackId::new("on_opened"))]
    );
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).len() == 1).await);
    // give a duplicate control message time to arrive before re-checking
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        publisher.subscribers(&event_id),
        vec![Subscriber {
            url: sub.clone(),
            callback: CallbackId::new("on_opened"),
        }]
    );

    subscriber.unsubscribe(&sub, &dome, "opened", callback.id()).await.unwrap();
    subscriber.unsubscribe(&sub, &dome, "opened", callback.id()).await.unwrap();

    assert!(subscriber.callbacks(&event_id).is_empty());
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).is_empty()).await);

    subscriber.shutdown().await;
    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_preserves_order() {
    const SUBSCRIBERS: usize = 3;
    const EVENTS: i64 = 25;

    let (publisher, _handle) = start_bus(fast_config()).await;
    let camera = publisher.object_url("Camera", Some("main")).unwrap();
    let event_id = EventId::new(&camera, "readout");

    let mut subscribers = Vec::new();
    for i in 0..SUBSCRIBERS {
        let bus = client_bus(fast_config());
        let sub = bus.object_url("Pipeline", Some(&format!("p{}", i))).unwrap();
        let (callback, seen) = recorder("on_readout");
        bus.subscribe(&sub, &camera, "readout", callback).await.unwrap();
        subscribers.push((bus, seen));
    }

    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).len() == SUBSCRIBERS).await);

    for n in 0..EVENTS {
        let receivers = publisher
            .publish(&camera, "readout", Args::positional(vec![json!(n)]))
            .await
            .unwrap();
        assert_eq!(receivers, SUBSCRIBERS);
    }

    let expected: Vec<i64> = (0..EVENTS).collect();
    for (bus, seen) in &subscribers {
        assert!(wait_until(WAIT, || seen.lock().len() == EVENTS as usize).await);
        assert_eq!(*seen.lock(), expected);
        bus.shutdown().await;
    }
    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_subscription() {
    let (bus, _handle) = start_bus(fast_config()).await;
    let focuser = bus.object_url("Focuser", Some("main")).unwrap();
    let sub = bus.object_url("Autofocus", Some("main")).unwrap();
    let event_id = EventId::new(&focuser, "moved");

    let (first, first_seen) = recorder("first");
    let (second, second_seen) = recorder("second");
    bus.subscribe(&sub, &focuser, "moved", first.clone()).await.unwrap();
    bus.subscribe(&sub, &focuser, "moved", second).await.unwrap();
    assert_eq!(bus.callbacks(&event_id).len(), 2);
    assert_eq!(bus.subscribers(&event_id).len(), 2);

    // one connection, one delivery, both callbacks
    let receivers = bus
        .publish(&focuser, "moved", Args::positional(vec![json!(1200)]))
        .await
        .unwrap();
    assert_eq!(receivers, 1);
    assert!(wait_until(WAIT, || second_seen.lock().len() == 1).await);
    assert_eq!(*first_seen.lock(), vec![1200]);

    bus.unsubscribe(&sub, &focuser, "moved", first.id()).await.unwrap();
    assert_eq!(
        bus.callbacks(&event_id),
        vec![Subscriber::new(&sub, &CallbackId::new("second"))]
    );
    assert_eq!(bus.subscribers(&event_id).len(), 1);

    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_without_subscribers() {
    let (bus, _handle) = start_bus(fast_config()).await;
    let dome = bus.object_url("Dome", Some("main")).unwrap();

    let receivers = bus.publish(&dome, "closed", Args::default()).await.unwrap();
    assert_eq!(receivers, 0);
    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_callback_does_not_stop_delivery() {
    let (publisher, _handle) = start_bus(fast_config()).await;
    let subscriber = client_bus(fast_config());
    let weather = publisher.object_url("WeatherStation", Some("main")).unwrap();
    let sub = subscriber.object_url("Supervisor", Some("main")).unwrap();
    let event_id = EventId::new(&weather, "unsafe");

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let faulty = Callback::new("faulty", |_: &Args| panic!("callback bug"));
    let counting = Callback::new("counting", move |_: &Args| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    subscriber.subscribe(&sub, &weather, "unsafe", faulty).await.unwrap();
    subscriber.subscribe(&sub, &weather, "unsafe", counting).await.unwrap();
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).len() == 2).await);

    for _ in 0..3 {
        publisher.publish(&weather, "unsafe", Args::default()).await.unwrap();
    }
    assert!(wait_until(WAIT, || hits.load(Ordering::SeqCst) == 3).await);

    subscriber.shutdown().await;
    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_to_unreachable_publisher_rolls_back() {
    let subscriber = client_bus(fast_config());
    let ghost = create_url(&free_endpoint(), "Dome", Some("main")).unwrap();
    let sub = subscriber.object_url("Scheduler", Some("main")).unwrap();
    let (callback, _seen) = recorder("on_opened");

    let error = subscriber
        .subscribe(&sub, &ghost, "opened", callback)
        .await
        .unwrap_err();
    assert!(error.is_connection());
    assert!(subscriber.callbacks(&EventId::new(&ghost, "opened")).is_empty());
    subscriber.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_callback_for_two_subscribers() {
    let (publisher, _handle) = start_bus(fast_config()).await;
    let subscriber = client_bus(fast_config());
    let dome = publisher.object_url("Dome", Some("main")).unwrap();
    let sub_a = subscriber.object_url("Scheduler", Some("a")).unwrap();
    let sub_b = subscriber.object_url("Scheduler", Some("b")).unwrap();
    let event_id = EventId::new(&dome, "opened");

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let callback = Callback::new("on_opened", move |_: &Args| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let id = callback.id().clone();

    subscriber.subscribe(&sub_a, &dome, "opened", callback.clone()).await.unwrap();
    subscriber.subscribe(&sub_b, &dome, "opened", callback.clone()).await.unwrap();

    let both = vec![Subscriber::new(&sub_a, &id), Subscriber::new(&sub_b, &id)];
    assert_eq!(subscriber.callbacks(&event_id), both);
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id) == both).await);

    // each registration fires once per event
    publisher.publish(&dome, "opened", Args::default()).await.unwrap();
    assert!(wait_until(WAIT, || hits.load(Ordering::SeqCst) == 2).await);

    subscriber.unsubscribe(&sub_b, &dome, "opened", &id).await.unwrap();
    let only_a = vec![Subscriber::new(&sub_a, &id)];
    assert_eq!(subscriber.callbacks(&event_id), only_a);
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id) == only_a).await);

    subscriber.unsubscribe(&sub_a, &dome, "opened", &id).await.unwrap();
    assert!(subscriber.callbacks(&event_id).is_empty());
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).is_empty()).await);

    subscriber.shutdown().await;
    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_unsubscribe_can_be_retried() {
    let (publisher, _handle) = start_bus(fast_config()).await;
    let endpoint = publisher.endpoint().clone();
    let subscriber = client_bus(fast_config());
    let dome = publisher.object_url("Dome", Some("main")).unwrap();
    let sub = subscriber.object_url("Scheduler", Some("main")).unwrap();
    let event_id = EventId::new(&dome, "opened");
    let (callback, _seen) = recorder("on_opened");
    let id = callback.id().clone();

    subscriber.subscribe(&sub, &dome, "opened", callback).await.unwrap();
    assert!(wait_until(WAIT, || publisher.subscribers(&event_id).len() == 1).await);

    publisher.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let error = subscriber
        .unsubscribe(&sub, &dome, "opened", &id)
        .await
        .unwrap_err();
    assert!(error.is_connection(), "{:?}", error);
    assert_eq!(subscriber.callbacks(&event_id), vec![Subscriber::new(&sub, &id)]);

    // the publisher comes back and has learned about the same subscriber again
    let (restarted, _handle) = restart_bus(endpoint, fast_config()).await;
    let helper = client_bus(fast_config());
    let (twin, _twin_seen) = recorder("on_opened");
    helper.subscribe(&sub, &dome, "opened", twin).await.unwrap();
    assert!(wait_until(WAIT, || restarted.subscribers(&event_id).len() == 1).await);

    subscriber.unsubscribe(&sub, &dome, "opened", &id).await.unwrap();
    assert!(subscriber.callbacks(&event_id).is_empty());
    assert!(wait_until(WAIT, || restarted.subscribers(&event_id).is_empty()).await);

    helper.shutdown().await;
    subscriber.shutdown().await;
    restarted.shutdown().await;
}
