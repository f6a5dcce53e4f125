//! Handler - the unit of message-processing logic.
//!
//! A `Handler<T>` processes one [`Envelope`] whose payload shape is `T` and
//! returns `Ok(())` to acknowledge or an error to have the transport
//! redeliver. Handlers are cheap to clone and compose with
//! [`Middleware`](crate::middleware::Middleware):
//!
//! ```ignore
//! use nsqueue::{Handler, middleware::{Notifier, Timer}};
//!
//! let handler = Handler::from_payload(|order: &Order| {
//!         billing::charge(order)?;
//!         Ok(())
//!     })
//!     .middleware(Notifier::new(done_tx))
//!     .middleware(Timer::named("billing"));
//! ```
//!
//! The last middleware applied is the outermost: above, the timer wraps the
//! notifier, which wraps the business logic.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::HandlerError;
use crate::middleware::Middleware;
use crate::transport::{MessageHandler, RawMessage};

type HandlerFn<T> = dyn Fn(&mut Envelope<'_, T>) -> Result<(), HandlerError> + Send + Sync;

/// A composable message handler over payloads of type `T`.
pub struct Handler<T> {
    call: Arc<HandlerFn<T>>,
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: 'static> Handler<T> {
    /// Build a handler from a closure over the envelope.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Envelope<'_, T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self { call: Arc::new(f) }
    }

    /// Run the handler against one envelope.
    ///
    /// A panic inside the handler is returned as [`HandlerError::Panicked`],
    /// so the middleware that called `invoke` still sees a result.
    pub fn invoke(&self, envelope: &mut Envelope<'_, T>) -> Result<(), HandlerError> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.call)(envelope))).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(id = %envelope.id(), attempts = envelope.attempts(), panic = %message, "handler panicked");
            Err(HandlerError::Panicked(message))
        })
    }

    /// Wrap this handler in `middleware`, returning the composed handler.
    ///
    /// `self` is left untouched; clones of it keep their old behavior.
    pub fn middleware<M: Middleware<T>>(self, middleware: M) -> Self {
        middleware.wrap(self)
    }
}

impl<T: DeserializeOwned + 'static> Handler<T> {
    /// Build a terminal handler that only needs the deserialized payload.
    pub fn from_payload<F>(f: F) -> Self
    where
        F: Fn(&T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::new(move |envelope| {
            let payload = envelope.bind()?;
            f(payload)
        })
    }

    /// Adapt the chain to the raw transport callback.
    ///
    /// Each delivery is wrapped in an `Envelope<T>` and bound before the
    /// chain runs; a body that does not fit `T` fails the delivery without
    /// reaching the chain. A panic while binding is reported as an error too.
    pub(crate) fn into_message_handler(self) -> MessageHandler {
        Arc::new(move |raw: &dyn RawMessage| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut envelope = Envelope::new(raw);
                envelope.bind()?;
                self.invoke(&mut envelope)
            }));

            outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(id = %raw.id(), attempts = raw.attempts(), panic = %message, "payload binding panicked");
                Err(HandlerError::Panicked(message))
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
