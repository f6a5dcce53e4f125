//! Ergonomic producer/consumer lifecycle over an NSQ-style message queue.
//!
//! A [`Queue`] owns one producer and any number of consumers on a
//! [`Transport`](transport::Transport). Consumers run [`Handler`] chains
//! whose payload type is bound from the JSON message body before the chain
//! runs; [`middleware`] wraps handlers with timing, notification and metrics.

mod config;
mod envelope;
mod error;
mod handler;
mod queue;
mod subscriber;

pub mod middleware;
pub mod transport;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "http")]
pub mod proxy;

pub use config::{Config, QueueConfig, DEFAULT_IN_FLIGHT_MULTIPLIER};
pub use envelope::Envelope;
pub use error::{ConfigError, HandlerError, QueueError, RegistrationError, TransportError};
pub use handler::Handler;
pub use middleware::{Middleware, Stack};
pub use queue::{Queue, QueueState};
pub use subscriber::Subscriber;
