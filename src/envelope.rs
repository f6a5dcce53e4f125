//! Envelope - one in-flight delivery plus its typed payload.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::HandlerError;
use crate::transport::{MessageId, RawMessage};

/// Wraps a raw transport delivery together with the payload shape `T` the
/// subscriber declared.
///
/// The payload is bound at most once. A failed bind leaves it unset, so a
/// later call sees the same error rather than a half-built value.
///
/// ## Example
///
/// ```ignore
/// let handler = Handler::new(|env: &mut Envelope<'_, Order>| {
///     let order = env.bind()?;
///     if order.items.is_empty() {
///         env.requeue_without_backoff(Duration::from_secs(5));
///     }
///     Ok(())
/// });
/// ```
pub struct Envelope<'a, T> {
    raw: &'a dyn RawMessage,
    payload: Option<T>,
}

impl<'a, T> Envelope<'a, T> {
    pub fn new(raw: &'a dyn RawMessage) -> Self {
        Self { raw, payload: None }
    }

    /// The bound payload, if `bind` has succeeded.
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut T> {
        self.payload.as_mut()
    }

    pub fn is_bound(&self) -> bool {
        self.payload.is_some()
    }

    /// Raw message body as delivered.
    pub fn body(&self) -> &[u8] {
        self.raw.body()
    }

    pub fn id(&self) -> MessageId {
        self.raw.id()
    }

    pub fn attempts(&self) -> u16 {
        self.raw.attempts()
    }

    /// Ask the transport to redeliver after `delay`, applying backoff.
    ///
    /// Takes effect when the chain returns, together with its result.
    pub fn requeue(&self, delay: Duration) {
        self.raw.requeue(delay);
    }

    pub fn requeue_without_backoff(&self, delay: Duration) {
        self.raw.requeue_without_backoff(delay);
    }
}

impl<'a, T: DeserializeOwned> Envelope<'a, T> {
    /// Deserialize the body into `T`, or return the already-bound payload.
    pub fn bind(&mut self) -> Result<&T, HandlerError> {
        let payload = match self.payload.take() {
            Some(payload) => payload,
            None => serde_json::from_slice(self.raw.body())?,
        };
        Ok(&*self.payload.insert(payload))
    }
}

impl<T: fmt::Debug> fmt::Debug for Envelope<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("payload", &self.payload)
            .finish()
    }
}
