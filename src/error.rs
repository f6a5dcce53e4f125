//! Error types for the queue, its handlers, and the transport seam.

use std::error::Error as StdError;

use thiserror::Error;

/// Invalid transport option supplied at `Queue::init`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The option name is not recognized by the transport configuration.
    #[error("unknown config option: {0}")]
    UnknownOption(String),
    /// The option is recognized but its value has the wrong type or range.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue { option: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(option: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            option: option.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The consumer is already attached to this address. Not fatal during connect.
    #[error("already connected")]
    AlreadyConnected,
    /// The endpoint could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The broker refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The producer or consumer has been stopped.
    #[error("stopped")]
    Stopped,
    /// A consumer was connected before any handler was attached.
    #[error("no handlers attached")]
    NoHandlers,
    /// Other error.
    #[error("transport error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

/// Why a consumer registration was refused.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("queue is not initialized")]
    NotInitialized,
    #[error("invalid subscriber: {0}")]
    InvalidSubscriber(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error type for queue lifecycle and publish operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("setting transport config option: {0}")]
    Config(#[from] ConfigError),

    #[error("connecting to transport: {0}")]
    Connection(#[source] TransportError),

    #[error("queue is not initialized")]
    NotInitialized,

    #[error("registering consumer {topic}/{channel}: {source}")]
    Registration {
        topic: String,
        channel: String,
        #[source]
        source: RegistrationError,
    },

    #[error("marshaling JSON: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("publishing to transport: {0}")]
    Publish(#[source] TransportError),

    #[error("unregistering topic/channel: {0}")]
    Unregister(#[source] TransportError),

    /// A `Queue::start` stage failed; `stage` names which one.
    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    pub(crate) fn registration(topic: &str, channel: &str, source: RegistrationError) -> Self {
        QueueError::Registration {
            topic: topic.to_string(),
            channel: channel.to_string(),
            source,
        }
    }

    pub(crate) fn stage(stage: impl Into<String>, source: QueueError) -> Self {
        QueueError::Stage {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// True when the operation failed because `init` had not been called,
    /// whichever surface reported it.
    pub fn is_not_initialized(&self) -> bool {
        match self {
            QueueError::NotInitialized => true,
            QueueError::Registration {
                source: RegistrationError::NotInitialized,
                ..
            } => true,
            QueueError::Stage { source, .. } => source.is_not_initialized(),
            _ => false,
        }
    }
}

/// Error returned from a message handler chain.
///
/// Any error tells the transport to redeliver the message under its backoff
/// policy. Business errors pass through middleware unchanged.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The message body could not be bound to the subscriber's payload type.
    #[error("unmarshaling JSON: {0}")]
    Deserialization(#[source] serde_json::Error),
    /// Business logic refused the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A handler panicked; the panic was caught at the handler boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    /// Wrap any error as an opaque handler failure.
    pub fn other(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Deserialization(err)
    }
}
