use std::sync::Arc;
use std::time::Duration;

use cafebucks::bus::{EventBus, InMemoryBroker};
use cafebucks::event::{Event, EventEnvelope};
use cafebucks::http;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::support::{broker, config, TOPIC};

struct Server {
    base: String,
    bus: Arc<EventBus<InMemoryBroker>>,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), http::ServeError>>,
}

async fn start(broker: &InMemoryBroker) -> Server {
    let bus = Arc::new(EventBus::connect(config(), broker).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let (stop, stopped) = oneshot::channel::<()>();
    let shutdown = async move {
        let _ = stopped.await;
    };
    let task = tokio::spawn(http::serve(
        Arc::clone(&bus),
        listener,
        shutdown,
        Duration::from_secs(5),
    ));

    Server {
        base,
        bus,
        stop: Some(stop),
        task,
    }
}

impl Server {
    async fn shutdown(mut self) -> Result<(), http::ServeError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap()
    }
}

// ============================================================================
// Routes
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_the_topic() {
    let broker = broker(3);
    let server = start(&broker).await;

    let response = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["topic"], TOPIC);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn posted_order_is_published_as_received() {
    let broker = broker(3);
    let server = start(&broker).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/orders", server.base))
        .json(&json!({ "order_id": 42, "item": { "name": "latte", "price": 3.5 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let envelope: EventEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.kind, Event::OrderReceived);
    assert_eq!(envelope.order.order_id, 42);
    assert_eq!(envelope.order.item.name, "latte");

    let stored = broker.records(TOPIC);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].envelope().unwrap(), envelope);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_order_is_a_bad_request() {
    let broker = broker(3);
    let server = start(&broker).await;

    let response = reqwest::Client::new()
        .post(format!("{}/orders", server.base))
        .header("content-type", "application/json")
        .body(r#"{"order_id": "forty-two"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(broker.is_empty(TOPIC));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_broker_is_a_bad_gateway() {
    let broker = broker(3);
    let server = start(&broker).await;
    broker.set_available(false);

    let response = reqwest::Client::new()
        .post(format!("{}/orders", server.base))
        .json(&json!({ "order_id": 1, "item": { "name": "mocha", "price": 4.0 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    broker.set_available(true);
    server.shutdown().await.unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn closed_bus_answers_unavailable() {
    let broker = broker(3);
    let server = start(&broker).await;
    let bus = Arc::clone(&server.bus);
    tokio::task::spawn_blocking(move || bus.close())
        .await
        .unwrap()
        .unwrap();

    let health = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(health.status(), 503);

    let response = reqwest::Client::new()
        .post(format!("{}/orders", server.base))
        .json(&json!({ "order_id": 1, "item": { "name": "latte", "price": 3.5 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_signal_stops_the_server_and_closes_the_bus() {
    let broker = broker(3);
    let server = start(&broker).await;
    let base = server.base.clone();
    let bus = Arc::clone(&server.bus);

    server.shutdown().await.unwrap();

    assert!(bus.is_closed());
    assert!(reqwest::get(format!("{base}/health")).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_shutdown_signal_closes_the_bus_and_is_reported() {
    let broker = broker(3);
    let bus = Arc::new(EventBus::connect(config(), &broker).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let signal = async {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "no signal handlers",
        ))
    };
    let result = http::serve_until(Arc::clone(&bus), listener, signal, Duration::from_secs(5)).await;

    assert!(matches!(result, Err(http::ServeError::Signal(_))));
    assert!(bus.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn resolved_shutdown_signal_is_a_clean_exit() {
    let broker = broker(3);
    let bus = Arc::new(EventBus::connect(config(), &broker).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    http::serve_until(Arc::clone(&bus), listener, async { Ok(()) }, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(bus.is_closed());
}
