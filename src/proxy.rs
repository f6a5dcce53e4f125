//! HTTP front for a [`Queue`]: publish over HTTP and scrape metrics.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `POST /pub/:topic` - publish the request body verbatim to `topic`.
//!   400 if the body cannot be read, 500 if the publish fails.
//! - `GET /metrics` - the injected [`Metrics`] in Prometheus text format.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nsqueue::{proxy, metrics::Metrics, transport::InMemoryTransport, Queue, QueueConfig};
//!
//! let mut queue = Queue::new(InMemoryTransport::new(), QueueConfig::new("in-memory"));
//! queue.init()?;
//!
//! let app = proxy::router(Arc::new(queue), Arc::new(Metrics::new()?));
//! proxy::serve(app, "0.0.0.0:4151").await?;
//! ```

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::queue::Queue;
use crate::transport::Transport;

struct ProxyState<T: Transport> {
    queue: Arc<Queue<T>>,
    metrics: Arc<Metrics>,
}

impl<T: Transport> Clone for ProxyState<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Build an axum `Router` over an initialized queue.
pub fn router<T>(queue: Arc<Queue<T>>, metrics: Arc<Metrics>) -> Router
where
    T: Transport + 'static,
{
    Router::new()
        .route("/pub/:topic", post(publish_handler::<T>))
        .route("/metrics", get(metrics_handler::<T>))
        .with_state(ProxyState { queue, metrics })
}

/// Serve `app` at the given address (e.g. `"0.0.0.0:4151"`).
pub async fn serve(app: Router, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn publish_handler<T: Transport + 'static>(
    State(state): State<ProxyState<T>>,
    Path(topic): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(topic, error = %rejection, "unreadable publish body");
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };

    match state.queue.publish_bytes(&topic, body.to_vec()) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!(topic, error = %err, "proxy publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn metrics_handler<T: Transport + 'static>(State(state): State<ProxyState<T>>) -> Response {
    match state.metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
