//! HTTP front door for placing orders.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `GET /health` - `{ "ok": true, "topic": ..., "group": ... }`
//! - `POST /orders` - body `{ "order_id": 42, "item": { "name": "latte", "price": 3.5 } }`;
//!   publishes `order_received` and answers `202` with the envelope
//!
//! ## Shutdown
//!
//! `serve` stops accepting connections when its shutdown future resolves, drains
//! in-flight requests, then closes the bus with whatever is left of the deadline,
//! so both teardowns share one bounded window.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::bus::{Connector, EventBus, PublishError, ShutdownError};
use crate::event::{Coffee, Event, Order};

/// Error returned by `serve`.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("http server failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("server task failed: {0}")]
    Task(String),
    #[error("shutdown signal failed")]
    Signal(#[source] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct NewOrder {
    order_id: i64,
    item: Coffee,
}

/// Build an axum `Router` that publishes orders to `bus`.
pub fn router<C: Connector + 'static>(bus: Arc<EventBus<C>>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<C>))
        .route("/orders", post(order_handler::<C>))
        .with_state(bus)
}

/// Serve `router(bus)` on `listener` until `shutdown` resolves, then close the
/// bus. `deadline` bounds the drain and the bus close together.
pub async fn serve<C, F>(
    bus: Arc<EventBus<C>>,
    listener: TcpListener,
    shutdown: F,
    deadline: Duration,
) -> Result<(), ServeError>
where
    C: Connector + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let (signalled_tx, signalled_rx) = oneshot::channel();
    let signal = async move {
        shutdown.await;
        info!("shutting HTTP server down gracefully");
        let _ = signalled_tx.send(Instant::now());
    };

    info!(%addr, topic = bus.topic(), "serving HTTP");
    let app = router(Arc::clone(&bus));
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
    });

    // Resolves early (with an error) if the server stops before any signal.
    let started = signalled_rx.await.unwrap_or_else(|_| Instant::now());

    let served = match tokio::time::timeout(deadline, &mut server).await {
        Ok(Ok(result)) => result.map_err(ServeError::from),
        Ok(Err(e)) => Err(ServeError::Task(e.to_string())),
        Err(_) => {
            warn!(?deadline, "HTTP drain exceeded the shutdown deadline");
            server.abort();
            Ok(())
        }
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    let closing = Arc::clone(&bus);
    let closed = tokio::task::spawn_blocking(move || closing.close_within(remaining))
        .await
        .map_err(|e| ServeError::Task(e.to_string()))?;

    info!(
        serve_err = ?served.as_ref().err(),
        close_err = ?closed.as_ref().err(),
        "server shut down"
    );
    served?;
    closed?;
    Ok(())
}

/// Like `serve`, but shuts down when `signal` resolves either way. A failed
/// signal still drains and closes the bus, then surfaces as
/// `ServeError::Signal`.
pub async fn serve_until<C, S>(
    bus: Arc<EventBus<C>>,
    listener: TcpListener,
    signal: S,
    deadline: Duration,
) -> Result<(), ServeError>
where
    C: Connector + 'static,
    S: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (failed_tx, mut failed_rx) = oneshot::channel();
    let shutdown = async move {
        if let Err(e) = signal.await {
            error!(error = %e, "shutdown signal failed");
            let _ = failed_tx.send(e);
        }
    };
    let served = serve(bus, listener, shutdown, deadline).await;
    if let Ok(e) = failed_rx.try_recv() {
        return Err(ServeError::Signal(e));
    }
    served
}

/// Resolves on SIGINT, SIGTERM, or SIGQUIT (Ctrl-C elsewhere).
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    info!(signal = name, "shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}

/// `GET /health`
async fn health_handler<C: Connector + 'static>(
    State(bus): State<Arc<EventBus<C>>>,
) -> impl IntoResponse {
    let status = if bus.is_closed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "ok": !bus.is_closed(),
        "topic": bus.topic(),
        "group": bus.config().group_id,
    });
    (status, Json(body))
}

/// `POST /orders`
async fn order_handler<C: Connector + 'static>(
    State(bus): State<Arc<EventBus<C>>>,
    body: Result<Json<NewOrder>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let body = json!({ "error": rejection.body_text() });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let order = Order::new(request.order_id, request.item);
    // Publishing blocks until the broker acknowledges.
    let published =
        tokio::task::spawn_blocking(move || bus.publish_order(Event::OrderReceived, &order)).await;

    match published {
        Ok(Ok(envelope)) => {
            info!(order_id = envelope.order.order_id, event_id = envelope.event_id, "order received");
            (StatusCode::ACCEPTED, Json(envelope)).into_response()
        }
        Ok(Err(e)) => {
            let status = match e {
                PublishError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            error!(error = %e, "failed to publish order");
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            error!(error = %e, "publish task failed");
            let body = json!({ "error": "internal error" });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}
