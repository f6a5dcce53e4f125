//! Queue - producer/consumer lifecycle over a [`Transport`].
//!
//! ```text
//!  Uninitialized ──init──▶ Initialized ──connect──▶ Connected
//!        ▲                     │ add_consumer*          │
//!        │                     │ subscribe              │
//!        └────────────────────stop◀─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use nsqueue::middleware::{Notifier, Timer};
//! use nsqueue::transport::InMemoryTransport;
//! use nsqueue::{Handler, Queue, QueueConfig, Subscriber};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     title: String,
//! }
//!
//! let (done_tx, done_rx) = mpsc::channel();
//! let handler = Handler::from_payload(|order: &Order| {
//!         assert_eq!(order.title, "x");
//!         Ok(())
//!     })
//!     .middleware(Notifier::new(done_tx))
//!     .middleware(Timer::named("billing"));
//!
//! let mut queue = Queue::new(InMemoryTransport::new(), QueueConfig::new("in-memory"));
//! queue.start(vec![Subscriber::new("orders", "billing", 2, handler)]).unwrap();
//!
//! queue.publish("orders", &Order { title: "x".into() }).unwrap();
//! assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().succeeded);
//!
//! queue.stop();
//! ```

use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Config, QueueConfig};
use crate::error::{ConfigError, QueueError, RegistrationError, TransportError};
use crate::handler::Handler;
use crate::subscriber::Subscriber;
use crate::transport::{Consumer, Endpoint, MessageHandler, Producer, Transport};

/// Lifecycle state of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Initialized,
    Connected,
}

/// Owns the producer and every consumer registration for one transport.
///
/// Setup and teardown (`init`, `add_consumer*`, `subscribe`, `connect`,
/// `stop`) take `&mut self` and are meant to be driven from one controlling
/// thread. Publishing takes `&self`, so a started queue can be shared behind
/// an `Arc`.
pub struct Queue<T: Transport> {
    transport: T,
    config: QueueConfig,
    transport_config: Option<Config>,
    producer: Option<T::Producer>,
    consumers: Vec<T::Consumer>,
    state: QueueState,
}

impl<T: Transport> Queue<T> {
    pub fn new(transport: T, config: QueueConfig) -> Self {
        Self {
            transport,
            config,
            transport_config: None,
            producer: None,
            consumers: Vec::new(),
            state: QueueState::Uninitialized,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state != QueueState::Uninitialized
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Registered consumers, in registration order.
    pub fn consumers(&self) -> &[T::Consumer] {
        &self.consumers
    }

    /// Build the transport config from the options and create the producer.
    ///
    /// Must run before consumers are added or anything is published. Calling
    /// it again on an initialized queue does nothing.
    pub fn init(&mut self) -> Result<(), QueueError> {
        if self.is_initialized() {
            debug!("queue already initialized");
            return Ok(());
        }
        if self.config.in_flight_multiplier == 0 {
            return Err(ConfigError::invalid("in_flight_multiplier", "must be at least 1").into());
        }

        let config = Config::from_options(&self.config.options)?;
        let producer = self
            .transport
            .new_producer(&self.config.nsqd, &config)
            .map_err(QueueError::Connection)?;

        info!(
            nsqd = %self.config.nsqd,
            lookupd = %self.config.lookupd,
            options = self.config.options.len(),
            "queue initialized"
        );
        self.transport_config = Some(config);
        self.producer = Some(producer);
        self.state = QueueState::Initialized;
        Ok(())
    }

    /// Register a consumer with zero or more handlers, each on a single worker.
    pub fn add_consumer<P, I>(&mut self, topic: &str, channel: &str, handlers: I) -> Result<&T::Consumer, QueueError>
    where
        P: DeserializeOwned + 'static,
        I: IntoIterator<Item = Handler<P>>,
    {
        let handlers = handlers.into_iter().map(Handler::into_message_handler).collect();
        self.register(topic, channel, Attach::Each(handlers))
    }

    /// Register a consumer running `handler` on `concurrency` parallel workers.
    ///
    /// Max-in-flight is raised to `concurrency * in_flight_multiplier`.
    pub fn add_consumer_with_concurrency<P>(
        &mut self,
        topic: &str,
        channel: &str,
        concurrency: usize,
        handler: Handler<P>,
    ) -> Result<&T::Consumer, QueueError>
    where
        P: DeserializeOwned + 'static,
    {
        self.register(
            topic,
            channel,
            Attach::Concurrent(handler.into_message_handler(), concurrency),
        )
    }

    /// Register the consumer described by `subscriber`.
    pub fn subscribe(&mut self, subscriber: Subscriber) -> Result<(), QueueError> {
        let (topic, channel, concurrency, handler) = subscriber.into_parts();
        self.register(&topic, &channel, Attach::Concurrent(handler, concurrency))?;
        Ok(())
    }

    fn register(&mut self, topic: &str, channel: &str, attach: Attach) -> Result<&T::Consumer, QueueError> {
        let fail = |source: RegistrationError| QueueError::registration(topic, channel, source);

        let config = match &self.transport_config {
            Some(config) if self.is_initialized() => config,
            _ => return Err(fail(RegistrationError::NotInitialized)),
        };
        if topic.is_empty() {
            return Err(fail(RegistrationError::InvalidSubscriber("topic must not be empty".into())));
        }
        if channel.is_empty() {
            return Err(fail(RegistrationError::InvalidSubscriber("channel must not be empty".into())));
        }
        let max_in_flight = match attach {
            Attach::Each(_) => None,
            Attach::Concurrent(_, 0) => {
                return Err(fail(RegistrationError::InvalidSubscriber(
                    "concurrency must be at least 1".into(),
                )))
            }
            Attach::Concurrent(_, concurrency) => match concurrency.checked_mul(self.config.in_flight_multiplier) {
                Some(max_in_flight) => Some(max_in_flight),
                None => return Err(fail(RegistrationError::InvalidSubscriber("concurrency too large".into()))),
            },
        };

        let consumer = self
            .transport
            .new_consumer(topic, channel, config)
            .map_err(|e| fail(e.into()))?;

        match attach {
            Attach::Each(handlers) => {
                for handler in handlers {
                    consumer.add_handler(handler);
                }
                info!(topic, channel, "consumer registered");
            }
            Attach::Concurrent(handler, concurrency) => {
                consumer.add_concurrent_handlers(handler, concurrency);
                if let Some(max_in_flight) = max_in_flight {
                    consumer.change_max_in_flight(max_in_flight);
                }
                info!(topic, channel, concurrency, ?max_in_flight, "consumer registered");
            }
        }

        self.consumers.push(consumer);
        Ok(&self.consumers[self.consumers.len() - 1])
    }

    /// Where consumers attach: the broker directly if one is configured,
    /// otherwise the discovery service.
    pub fn endpoint(&self) -> Endpoint {
        if self.config.nsqd.is_empty() {
            Endpoint::Lookupd(self.config.lookupd.clone())
        } else {
            Endpoint::Nsqd(self.config.nsqd.clone())
        }
    }

    /// Attach every registered consumer to the transport.
    ///
    /// Consumers that are already attached are skipped, so this can be called
    /// again after more consumers were added. The first other failure aborts;
    /// consumers after it are not attempted.
    pub fn connect(&mut self) -> Result<(), QueueError> {
        if !self.is_initialized() {
            return Err(QueueError::NotInitialized);
        }

        let endpoint = self.endpoint();
        for consumer in &self.consumers {
            match consumer.connect(&endpoint) {
                Ok(()) => {
                    info!(topic = consumer.topic(), channel = consumer.channel(), %endpoint, "consumer connected");
                }
                Err(TransportError::AlreadyConnected) => {
                    debug!(topic = consumer.topic(), channel = consumer.channel(), %endpoint, "consumer already connected");
                }
                Err(err) => return Err(QueueError::Connection(err)),
            }
        }

        self.state = QueueState::Connected;
        Ok(())
    }

    /// `init`, `subscribe` each subscriber, then `connect`.
    ///
    /// Stops at the first failure; the error names the stage.
    pub fn start<I>(&mut self, subscribers: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = Subscriber>,
    {
        self.init().map_err(|e| QueueError::stage("initializing queue", e))?;

        for subscriber in subscribers {
            let stage = format!("subscribing to {}/{}", subscriber.topic(), subscriber.channel());
            self.subscribe(subscriber).map_err(|e| QueueError::stage(stage, e))?;
        }

        self.connect().map_err(|e| QueueError::stage("connecting consumers", e))
    }

    /// Stop every consumer, then the producer, and return to `Uninitialized`.
    ///
    /// Consumers are stopped in parallel; this blocks until each has drained
    /// its in-flight deliveries. Only then is the producer stopped, which
    /// blocks until its pending publishes are flushed.
    pub fn stop(&mut self) {
        if !self.is_initialized() {
            debug!("stop called on uninitialized queue");
            return;
        }
        info!(consumers = self.consumers.len(), "stopping queue");

        thread::scope(|scope| {
            for consumer in &self.consumers {
                scope.spawn(move || {
                    consumer.stop();
                    consumer.wait_stopped();
                    debug!(topic = consumer.topic(), channel = consumer.channel(), "consumer stopped");
                });
            }
        });

        if let Some(producer) = self.producer.take() {
            producer.stop();
        }

        self.consumers.clear();
        self.transport_config = None;
        self.state = QueueState::Uninitialized;
        info!("queue stopped");
    }

    /// Remove a topic/channel registration from the broker. Meant for test teardown.
    pub fn unregister(&self, topic: &str, channel: &str) -> Result<(), QueueError> {
        self.transport.unregister(topic, channel).map_err(QueueError::Unregister)
    }

    fn producer(&self) -> Result<&T::Producer, QueueError> {
        match &self.producer {
            Some(producer) if self.is_initialized() => Ok(producer),
            _ => Err(QueueError::NotInitialized),
        }
    }

    /// Serialize `obj` to JSON and publish it.
    pub fn publish<S: Serialize + ?Sized>(&self, topic: &str, obj: &S) -> Result<(), QueueError> {
        let producer = self.producer()?;
        let body = serde_json::to_vec(obj).map_err(QueueError::Serialization)?;
        producer.publish(topic, body).map_err(QueueError::Publish)
    }

    /// Serialize `obj` to JSON and publish it, visible to consumers after `delay`.
    pub fn deferred_publish<S: Serialize + ?Sized>(
        &self,
        topic: &str,
        obj: &S,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let producer = self.producer()?;
        let body = serde_json::to_vec(obj).map_err(QueueError::Serialization)?;
        producer.deferred_publish(topic, delay, body).map_err(QueueError::Publish)
    }

    /// Publish every object in one transport round-trip.
    ///
    /// All objects are serialized first; if any fails, nothing is sent.
    pub fn bulk_publish<S: Serialize>(&self, topic: &str, objs: &[S]) -> Result<(), QueueError> {
        let producer = self.producer()?;
        let bodies = objs
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::Serialization)?;
        producer.multi_publish(topic, bodies).map_err(QueueError::Publish)
    }

    /// Publish `body` as-is, without JSON encoding.
    pub fn publish_bytes(&self, topic: &str, body: Vec<u8>) -> Result<(), QueueError> {
        self.producer()?.publish(topic, body).map_err(QueueError::Publish)
    }
}

enum Attach {
    Each(Vec<MessageHandler>),
    Concurrent(MessageHandler, usize),
}
