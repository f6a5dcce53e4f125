//! In-memory transport for testing and single-process scenarios.
//!
//! Behaves like a single broker node:
//! - Topics fan out to channels; each channel is a competing-consumer queue
//! - Messages published before a topic has channels are held and handed to
//!   the first channel created
//! - Failed deliveries are requeued with a delay that grows with attempts,
//!   and dropped once `max_attempts` is exceeded
//!
//! ## Example
//!
//! ```
//! use nsqueue::Config;
//! use nsqueue::transport::{InMemoryTransport, Producer, Transport};
//!
//! let transport = InMemoryTransport::new();
//! let config = Config::new();
//! let _consumer = transport.new_consumer("orders", "billing", &config).unwrap();
//!
//! let producer = transport.new_producer("in-memory", &config).unwrap();
//! producer.publish("orders", br#"{"title":"x"}"#.to_vec()).unwrap();
//!
//! assert_eq!(transport.depth("orders", "billing"), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Consumer, Endpoint, MessageHandler, MessageId, Producer, RawMessage, Transport};
use crate::config::Config;
use crate::error::TransportError;

/// Upper bound on how long an idle worker sleeps before re-checking state.
const IDLE_WAIT: Duration = Duration::from_millis(50);

const MAX_NAME_LEN: usize = 64;

/// Longest delay a deferred publish may ask for, as nsqd's default `max-req-timeout`.
pub const MAX_DEFER_DELAY: Duration = Duration::from_secs(60 * 60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_name(kind: &str, name: &str) -> Result<(), TransportError> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(TransportError::Rejected(format!("invalid {} name {:?}", kind, name)))
    }
}

#[derive(Clone)]
struct Queued {
    id: MessageId,
    body: Vec<u8>,
    attempts: u16,
    ready_at: Instant,
}

#[derive(Default)]
struct ChannelQueue {
    messages: Mutex<VecDeque<Queued>>,
    ready: Condvar,
}

impl ChannelQueue {
    fn push(&self, messages: impl IntoIterator<Item = Queued>) {
        lock(&self.messages).extend(messages);
        self.ready.notify_all();
    }

    fn wake(&self) {
        let _guard = lock(&self.messages);
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct TopicState {
    backlog: Vec<Queued>,
    channels: HashMap<String, Arc<ChannelQueue>>,
}

#[derive(Default)]
struct Broker {
    topics: Mutex<HashMap<String, TopicState>>,
    sequence: AtomicU64,
}

impl Broker {
    fn enqueue(&self, topic: &str, bodies: Vec<Vec<u8>>, delay: Duration) {
        let ready_at = Instant::now() + delay;
        let messages: Vec<Queued> = bodies
            .into_iter()
            .map(|body| Queued {
                id: MessageId::from_sequence(self.sequence.fetch_add(1, Ordering::SeqCst)),
                body,
                attempts: 0,
                ready_at,
            })
            .collect();

        let mut topics = lock(&self.topics);
        let state = topics.entry(topic.to_string()).or_default();
        if state.channels.is_empty() {
            state.backlog.extend(messages);
            return;
        }
        for channel in state.channels.values() {
            channel.push(messages.iter().cloned());
        }
    }

    fn channel(&self, topic: &str, channel: &str) -> Arc<ChannelQueue> {
        let mut topics = lock(&self.topics);
        let state = topics.entry(topic.to_string()).or_default();
        if let Some(queue) = state.channels.get(channel) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(ChannelQueue::default());
        if state.channels.is_empty() && !state.backlog.is_empty() {
            queue.push(state.backlog.drain(..));
        }
        state.channels.insert(channel.to_string(), Arc::clone(&queue));
        queue
    }
}

/// In-process broker implementing [`Transport`].
///
/// Cloning yields another handle to the same broker, so a test can keep one
/// handle for inspection while the queue owns the other.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting (ready or deferred) on a channel.
    pub fn depth(&self, topic: &str, channel: &str) -> usize {
        lock(&self.broker.topics)
            .get(topic)
            .and_then(|state| state.channels.get(channel))
            .map(|queue| lock(&queue.messages).len())
            .unwrap_or(0)
    }

    /// Messages held by a topic that has no channels yet.
    pub fn backlog(&self, topic: &str) -> usize {
        lock(&self.broker.topics)
            .get(topic)
            .map(|state| state.backlog.len())
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.broker.topics).keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn channels(&self, topic: &str) -> Vec<String> {
        let mut channels: Vec<String> = lock(&self.broker.topics)
            .get(topic)
            .map(|state| state.channels.keys().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }
}

impl Transport for InMemoryTransport {
    type Producer = InMemoryProducer;
    type Consumer = InMemoryConsumer;

    fn new_producer(&self, address: &str, _config: &Config) -> Result<InMemoryProducer, TransportError> {
        Ok(InMemoryProducer {
            broker: Arc::clone(&self.broker),
            address: address.to_string(),
            stopped: AtomicBool::new(false),
        })
    }

    fn new_consumer(&self, topic: &str, channel: &str, config: &Config) -> Result<InMemoryConsumer, TransportError> {
        validate_name("topic", topic)?;
        validate_name("channel", channel)?;

        let queue = self.broker.channel(topic, channel);
        Ok(InMemoryConsumer {
            shared: Arc::new(ConsumerShared {
                topic: topic.to_string(),
                channel: channel.to_string(),
                queue,
                config: config.clone(),
                max_in_flight: AtomicUsize::new(config.max_in_flight),
                in_flight: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                stats: Mutex::new(ConsumerStats::default()),
            }),
            handlers: Mutex::new(Vec::new()),
            endpoints: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    fn unregister(&self, topic: &str, channel: &str) -> Result<(), TransportError> {
        let mut topics = lock(&self.broker.topics);
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::Rejected(format!("topic {} not found", topic)))?;
        if let Some(queue) = state.channels.remove(channel) {
            queue.wake();
        }
        if state.channels.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }
}

/// Producer half of [`InMemoryTransport`].
pub struct InMemoryProducer {
    broker: Arc<Broker>,
    address: String,
    stopped: AtomicBool,
}

impl InMemoryProducer {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn check(&self, topic: &str) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        validate_name("topic", topic)
    }
}

impl Producer for InMemoryProducer {
    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), TransportError> {
        self.check(topic)?;
        self.broker.enqueue(topic, vec![body], Duration::ZERO);
        Ok(())
    }

    fn deferred_publish(&self, topic: &str, delay: Duration, body: Vec<u8>) -> Result<(), TransportError> {
        self.check(topic)?;
        if delay > MAX_DEFER_DELAY {
            return Err(TransportError::Rejected(format!(
                "defer delay {:?} exceeds {:?}",
                delay, MAX_DEFER_DELAY
            )));
        }
        self.broker.enqueue(topic, vec![body], delay);
        Ok(())
    }

    fn multi_publish(&self, topic: &str, bodies: Vec<Vec<u8>>) -> Result<(), TransportError> {
        self.check(topic)?;
        if bodies.is_empty() {
            return Err(TransportError::Rejected("empty batch".into()));
        }
        self.broker.enqueue(topic, bodies, Duration::ZERO);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Delivery counters for one consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries the handler acknowledged.
    pub handled: usize,
    /// Deliveries the handler failed.
    pub failed: usize,
    /// Deliveries put back on the channel, explicitly or after a failure.
    pub requeued: usize,
    /// Messages discarded after exceeding `max_attempts`.
    pub dropped: usize,
}

struct ConsumerShared {
    topic: String,
    channel: String,
    queue: Arc<ChannelQueue>,
    config: Config,
    max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    stopping: AtomicBool,
    stats: Mutex<ConsumerStats>,
}

impl ConsumerShared {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Block until a ready message fits under max-in-flight, or the consumer stops.
    fn next_message(&self) -> Option<Queued> {
        let mut messages = lock(&self.queue.messages);
        loop {
            if self.stopping() {
                return None;
            }

            let now = Instant::now();
            let has_capacity = self.in_flight.load(Ordering::SeqCst) < self.max_in_flight.load(Ordering::SeqCst);
            if has_capacity {
                if let Some(pos) = messages.iter().position(|m| m.ready_at <= now) {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return messages.remove(pos);
                }
            }

            let wait = if has_capacity {
                messages
                    .iter()
                    .map(|m| m.ready_at.saturating_duration_since(now))
                    .min()
                    .map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT))
            } else {
                IDLE_WAIT
            };
            messages = self
                .queue
                .ready
                .wait_timeout(messages, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Put a delivery back on the channel. Delays are capped at `max_requeue_delay`.
    fn requeue(&self, delivery: Delivery, delay: Duration) {
        let delay = delay.min(self.config.max_requeue_delay);
        debug!(
            topic = %self.topic,
            channel = %self.channel,
            id = %delivery.id,
            attempts = delivery.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "requeueing message"
        );
        lock(&self.stats).requeued += 1;
        self.queue.push([Queued {
            id: delivery.id,
            body: delivery.body,
            attempts: delivery.attempts,
            ready_at: Instant::now() + delay,
        }]);
    }

    fn failure_delay(&self, attempts: u16) -> Duration {
        (self.config.default_requeue_delay * u32::from(attempts)).min(self.config.max_requeue_delay)
    }

    fn backoff_delay(&self, attempts: u16) -> Duration {
        (self.config.backoff_multiplier * u32::from(attempts)).min(self.config.max_backoff_duration)
    }

    /// Pause this worker, waking early if the consumer stops.
    fn backoff(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        let mut messages = lock(&self.queue.messages);
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            messages = self
                .queue
                .ready
                .wait_timeout(messages, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn run_worker(&self, handler: &MessageHandler) {
        while let Some(queued) = self.next_message() {
            let delivery = Delivery::new(queued);
            let max_attempts = self.config.max_attempts;

            if max_attempts > 0 && delivery.attempts > max_attempts {
                warn!(
                    topic = %self.topic,
                    channel = %self.channel,
                    id = %delivery.id,
                    attempts = delivery.attempts,
                    "giving up on message after max_attempts"
                );
                lock(&self.stats).dropped += 1;
                self.settled();
                continue;
            }

            let result = handler(&delivery);
            let requested = delivery.take_requeue();
            let attempts = delivery.attempts;

            let backoff = match (result, requested) {
                (_, Some(request)) => {
                    self.requeue(delivery, request.delay);
                    request.backoff
                }
                (Ok(()), None) => {
                    lock(&self.stats).handled += 1;
                    false
                }
                (Err(err), None) => {
                    debug!(topic = %self.topic, channel = %self.channel, error = %err, "handler failed");
                    lock(&self.stats).failed += 1;
                    let delay = self.failure_delay(attempts);
                    self.requeue(delivery, delay);
                    true
                }
            };
            self.settled();

            if backoff {
                self.backoff(self.backoff_delay(attempts));
            }
        }
    }

    fn settled(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.queue.wake();
    }
}

/// Consumer half of [`InMemoryTransport`].
///
/// Workers start on the first successful `connect` and run until `stop`.
pub struct InMemoryConsumer {
    shared: Arc<ConsumerShared>,
    handlers: Mutex<Vec<(MessageHandler, usize)>>,
    endpoints: Mutex<HashSet<Endpoint>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("endpoints", &*lock(&self.endpoints))
            .field("workers", &lock(&self.workers).len())
            .finish()
    }
}

impl InMemoryConsumer {
    pub fn stats(&self) -> ConsumerStats {
        lock(&self.shared.stats).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Number of worker threads currently attached.
    pub fn workers(&self) -> usize {
        lock(&self.workers).len()
    }

    fn spawn_workers(&self) {
        let handlers = lock(&self.handlers);
        let mut workers = lock(&self.workers);
        for (handler, concurrency) in handlers.iter() {
            for _ in 0..*concurrency {
                let shared = Arc::clone(&self.shared);
                let handler = Arc::clone(handler);
                workers.push(thread::spawn(move || {
                    debug!(topic = %shared.topic, channel = %shared.channel, "worker started");
                    shared.run_worker(&handler);
                    debug!(topic = %shared.topic, channel = %shared.channel, "worker exited");
                }));
            }
        }
    }
}

impl Consumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.shared.topic
    }

    fn channel(&self) -> &str {
        &self.shared.channel
    }

    fn add_handler(&self, handler: MessageHandler) {
        self.add_concurrent_handlers(handler, 1);
    }

    fn add_concurrent_handlers(&self, handler: MessageHandler, concurrency: usize) {
        lock(&self.handlers).push((handler, concurrency));
    }

    fn change_max_in_flight(&self, max_in_flight: usize) {
        self.shared.max_in_flight.store(max_in_flight, Ordering::SeqCst);
        self.shared.queue.wake();
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.shared.stopping() {
            return Err(TransportError::Stopped);
        }
        if lock(&self.handlers).is_empty() {
            return Err(TransportError::NoHandlers);
        }
        let first = {
            let mut endpoints = lock(&self.endpoints);
            if !endpoints.insert(endpoint.clone()) {
                return Err(TransportError::AlreadyConnected);
            }
            endpoints.len() == 1
        };
        if first {
            self.spawn_workers();
        }
        Ok(())
    }

    fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
    }

    fn wait_stopped(&self) {
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!(topic = %self.shared.topic, channel = %self.shared.channel, "worker thread panicked");
            }
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
        // Don't join on drop - workers exit on their own
    }
}

struct RequeueRequest {
    delay: Duration,
    backoff: bool,
}

struct Delivery {
    id: MessageId,
    body: Vec<u8>,
    attempts: u16,
    requeue: Mutex<Option<RequeueRequest>>,
}

impl Delivery {
    fn new(queued: Queued) -> Self {
        Self {
            id: queued.id,
            body: queued.body,
            attempts: queued.attempts.saturating_add(1),
            requeue: Mutex::new(None),
        }
    }

    fn take_requeue(&self) -> Option<RequeueRequest> {
        lock(&self.requeue).take()
    }
}

impl RawMessage for Delivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn id(&self) -> MessageId {
        self.id
    }

    fn attempts(&self) -> u16 {
        self.attempts
    }

    fn requeue(&self, delay: Duration) {
        *lock(&self.requeue) = Some(RequeueRequest { delay, backoff: true });
    }

    fn requeue_without_backoff(&self, delay: Duration) {
        *lock(&self.requeue) = Some(RequeueRequest { delay, backoff: false });
    }
}
