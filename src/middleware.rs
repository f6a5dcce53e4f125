//! Middleware - wrap a [`Handler`] with cross-cutting behavior.
//!
//! A middleware receives the next handler and returns a new one. It decides
//! whether and when to call `next`; the ones in this module always call it
//! exactly once and hand its result back unchanged.
//!
//! Any `Fn(Handler<T>) -> Handler<T>` closure is a middleware:
//!
//! ```ignore
//! let audited = handler.middleware(|next: Handler<Order>| {
//!     Handler::new(move |env| {
//!         audit::record(env.id());
//!         next.invoke(env)
//!     })
//! });
//! ```

use std::sync::mpsc::Sender;
use std::time::Instant;

use tracing::{debug, info};

use crate::handler::Handler;
use crate::transport::MessageId;

#[cfg(feature = "metrics")]
use std::sync::Arc;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Transforms one handler into another.
pub trait Middleware<T> {
    fn wrap(&self, next: Handler<T>) -> Handler<T>;
}

impl<T, F> Middleware<T> for F
where
    F: Fn(Handler<T>) -> Handler<T>,
{
    fn wrap(&self, next: Handler<T>) -> Handler<T> {
        self(next)
    }
}

/// An ordered list of middleware, outermost first.
///
/// `Stack::new().layer(a).layer(b).apply(h)` is the same handler as
/// `h.middleware(b).middleware(a)`: `a` runs first on the way in and last on
/// the way out.
pub struct Stack<T> {
    layers: Vec<Box<dyn Middleware<T> + Send + Sync>>,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<T: 'static> Stack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<T> + Send + Sync + 'static,
    {
        self.layers.push(Box::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wrap `handler` in every layer.
    pub fn apply(&self, handler: Handler<T>) -> Handler<T> {
        self.layers
            .iter()
            .rev()
            .fold(handler, |inner, layer| layer.wrap(inner))
    }
}

/// Logs start, finish and elapsed time around the inner handler.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    label: String,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every log line with `label`.
    pub fn named(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl<T: 'static> Middleware<T> for Timer {
    fn wrap(&self, next: Handler<T>) -> Handler<T> {
        let label = self.label.clone();
        Handler::new(move |envelope| {
            let started = Instant::now();
            info!(handler = %label, id = %envelope.id(), "start");

            let result = next.invoke(envelope);

            info!(
                handler = %label,
                id = %envelope.id(),
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                ok = result.is_ok(),
                "finish"
            );
            result
        })
    }
}

/// Sent by [`Notifier`] once per processed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: MessageId,
    pub attempts: u16,
    pub succeeded: bool,
}

/// Signals a caller-owned channel after every invocation, success or not.
///
/// The channel is unbounded, so a slow receiver never stalls a worker. A
/// receiver that has gone away is ignored.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl<T: 'static> Middleware<T> for Notifier {
    fn wrap(&self, next: Handler<T>) -> Handler<T> {
        let tx = self.tx.clone();
        Handler::new(move |envelope| {
            let result = next.invoke(envelope);
            let notification = Notification {
                id: envelope.id(),
                attempts: envelope.attempts(),
                succeeded: result.is_ok(),
            };
            if tx.send(notification).is_err() {
                debug!(id = %envelope.id(), "notification receiver dropped");
            }
            result
        })
    }
}

/// Per-topic in-flight gauge and message counter around the inner handler.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct Metered {
    metrics: Arc<Metrics>,
    topic: String,
}

#[cfg(feature = "metrics")]
impl Metered {
    pub fn new(metrics: Arc<Metrics>, topic: impl Into<String>) -> Self {
        Self {
            metrics,
            topic: topic.into(),
        }
    }
}

#[cfg(feature = "metrics")]
impl<T: 'static> Middleware<T> for Metered {
    fn wrap(&self, next: Handler<T>) -> Handler<T> {
        let metrics = Arc::clone(&self.metrics);
        let topic = self.topic.clone();
        Handler::new(move |envelope| {
            let result = {
                let _in_flight = metrics.track_in_flight(&topic);
                next.invoke(envelope)
            };
            metrics.record(&topic, result.is_ok());
            result
        })
    }
}
