//! Subscriber - a declarative consumption point.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::handler::Handler;
use crate::transport::MessageHandler;

/// Binds a topic/channel pair to a handler chain and a payload shape.
///
/// The shape is the handler's type parameter; it is captured when the
/// subscriber is built, so a queue can hold subscribers of different
/// payload types side by side. Nothing is validated here; the queue checks
/// the descriptor when it registers it.
///
/// ## Example
///
/// ```ignore
/// let billing = Subscriber::new(
///     "orders",
///     "billing",
///     4,
///     Handler::from_payload(|order: &Order| charge(order)).middleware(Timer::new()),
/// );
/// queue.start(vec![billing])?;
/// ```
pub struct Subscriber {
    topic: String,
    channel: String,
    concurrency: usize,
    handler: MessageHandler,
}

impl Subscriber {
    pub fn new<T>(
        topic: impl Into<String>,
        channel: impl Into<String>,
        concurrency: usize,
        handler: Handler<T>,
    ) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            concurrency,
            handler: handler.into_message_handler(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub(crate) fn into_parts(self) -> (String, String, usize, MessageHandler) {
        (self.topic, self.channel, self.concurrency, self.handler)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
