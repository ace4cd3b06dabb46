//! Error types.
//!
//! Configuration errors are raised while event kinds, handlers and
//! containers are being defined, before any network interaction.
//! Transport errors surface from the broker. Handler errors stay local
//! to the consuming side.

use thiserror::Error;

/// Maximum length of an event type in bytes (topic routing key limit).
pub const MAX_EVENT_TYPE_LEN: usize = 255;

/// Errors raised while defining events, handlers or containers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// An event kind was defined without a `type`.
    #[error("event kind '{kind}' cannot be created without a 'type' attribute")]
    EventTypeMissing {
        /// Name of the offending event kind.
        kind: String,
    },

    /// An event kind was defined with a `type` longer than 255 bytes.
    #[error("event type \"{event_type}\" too long, should be < {MAX_EVENT_TYPE_LEN} bytes")]
    EventTypeTooLong {
        /// The offending event type.
        event_type: String,
    },

    /// An event handler was registered with an illegal combination of options.
    #[error("event handler configuration error: {0}")]
    EventHandlerConfiguration(String),

    /// A configuration value could not be interpreted.
    #[error("invalid value for config key {key}: {reason}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A handler registration was moved through an illegal lifecycle step.
    #[error("handler registration for queue {queue} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The registration's queue name, or its event type when unbound.
        queue: String,
        /// State before the transition.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },
}

/// Errors surfaced by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker cannot be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Publishing or binding referenced an exchange that was never declared.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consuming or binding referenced a queue that does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// An exchange or queue was redeclared with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An ack or requeue referenced a delivery the broker does not know.
    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery {
        /// Queue the delivery was expected on.
        queue: String,
        /// The delivery tag.
        tag: u64,
    },

    /// The channel to the broker was closed.
    #[error("transport closed")]
    Closed,
}

/// Errors raised by event or RPC handlers while processing a message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler failed.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The message payload could not be decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl HandlerError {
    /// Short machine-readable name for this error, used in RPC replies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "HandlerFailed",
            Self::Payload(_) => "PayloadError",
        }
    }
}

/// Errors returned by [`EventDispatcher::dispatch`](crate::dispatcher::EventDispatcher::dispatch).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The publish failed at the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A typed event could not be serialized.
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A typed event's kind failed validation.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Errors returned by RPC proxy calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request or reply could not be moved through the broker.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The remote entrypoint failed.
    #[error("remote error {kind}: {message}")]
    Remote {
        /// Machine-readable error kind reported by the remote side.
        kind: String,
        /// Human-readable message.
        message: String,
    },

    /// No reply arrived within the proxy's timeout.
    #[error("rpc call to {0} timed out")]
    Timeout(String),

    /// The reply payload had neither a result nor an error.
    #[error("malformed rpc reply: {0}")]
    MalformedReply(String),

    /// The reply listener stopped before a reply arrived.
    #[error("reply listener closed")]
    Closed,
}
