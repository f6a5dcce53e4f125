//! Transport seam - the message-queue client this crate drives.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Queue (lifecycle, publish)                  │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Transport / Producer / Consumer traits              │
//! │  Producer: publish / deferred_publish / multi_publish        │
//! │  Consumer: add_handler / connect / change_max_in_flight      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────┐               ┌─────────────────────────┐
//! │ InMemoryTransport│               │  NSQ client (external)  │
//! │   (included)     │               │                         │
//! └──────────────────┘               └─────────────────────────┘
//! ```
//!
//! Delivery, backoff and in-flight accounting belong to the transport. The
//! crate only hands it a [`MessageHandler`] per consumer and reacts to the
//! results of the lifecycle calls.

#[cfg(feature = "in-memory")]
mod in_memory;

#[cfg(feature = "in-memory")]
pub use in_memory::{ConsumerStats, InMemoryConsumer, InMemoryProducer, InMemoryTransport};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{HandlerError, TransportError};

/// Raw handler attached to a transport consumer.
///
/// Built from a typed [`Handler`](crate::Handler) chain by the queue. The
/// returned error decides redelivery: `Ok` acknowledges, `Err` requeues.
pub type MessageHandler = Arc<dyn Fn(&dyn RawMessage) -> Result<(), HandlerError> + Send + Sync>;

/// A 16-byte message identifier as assigned by the broker.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Hex-encoded sequence number, the way nsqd formats its ids.
    pub fn from_sequence(seq: u64) -> Self {
        let mut bytes = [b'0'; 16];
        let hex = format!("{:016x}", seq);
        bytes.copy_from_slice(hex.as_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// One delivery as handed over by the transport.
pub trait RawMessage {
    fn body(&self) -> &[u8];

    fn id(&self) -> MessageId;

    /// Delivery count, starting at 1 and growing across redeliveries.
    fn attempts(&self) -> u16;

    /// Ask for redelivery after `delay`, with consumer backoff.
    fn requeue(&self, delay: Duration);

    /// Ask for redelivery after `delay` without triggering backoff.
    fn requeue_without_backoff(&self, delay: Duration);
}

/// Where consumers attach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A broker node, addressed directly.
    Nsqd(String),
    /// A discovery service that resolves producers of the topic.
    Lookupd(String),
}

impl Endpoint {
    pub fn address(&self) -> &str {
        match self {
            Endpoint::Nsqd(addr) | Endpoint::Lookupd(addr) => addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Nsqd(addr) => write!(f, "nsqd://{}", addr),
            Endpoint::Lookupd(addr) => write!(f, "lookupd://{}", addr),
        }
    }
}

/// Publishing half of a transport connection.
pub trait Producer: Send + Sync {
    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), TransportError>;

    fn deferred_publish(&self, topic: &str, delay: Duration, body: Vec<u8>) -> Result<(), TransportError>;

    /// Publish all bodies in one round-trip.
    fn multi_publish(&self, topic: &str, bodies: Vec<Vec<u8>>) -> Result<(), TransportError>;

    /// Stop the producer. Blocks until pending publishes are drained.
    fn stop(&self);
}

/// Consuming half: one subscription to a topic/channel pair.
pub trait Consumer: Send + Sync {
    fn topic(&self) -> &str;

    fn channel(&self) -> &str;

    fn add_handler(&self, handler: MessageHandler);

    /// Attach `handler` on `concurrency` parallel workers sharing this subscription.
    fn add_concurrent_handlers(&self, handler: MessageHandler, concurrency: usize);

    fn change_max_in_flight(&self, max_in_flight: usize);

    /// Attach to `endpoint`. `TransportError::AlreadyConnected` when already attached there.
    fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Signal workers to stop taking deliveries. Does not wait.
    fn stop(&self);

    /// Block until every worker has drained and exited.
    fn wait_stopped(&self);
}

/// Factory for producers and consumers, plus broker administration.
pub trait Transport: Send + Sync {
    type Producer: Producer;
    type Consumer: Consumer;

    fn new_producer(&self, address: &str, config: &Config) -> Result<Self::Producer, TransportError>;

    fn new_consumer(&self, topic: &str, channel: &str, config: &Config) -> Result<Self::Consumer, TransportError>;

    /// Remove a topic/channel registration from the broker.
    fn unregister(&self, topic: &str, channel: &str) -> Result<(), TransportError>;
}
