//! Exchange and queue descriptors.

use serde::{Deserialize, Serialize};

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Routes by pattern match on the routing key.
    Topic,
    /// Routes by exact routing key match.
    Direct,
}

/// Whether published messages survive a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Messages live in memory only.
    Transient,
    /// Messages are persisted by the broker.
    Persistent,
}

/// Declaration of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeDescriptor {
    /// Exchange name.
    pub name: String,
    /// Routing behaviour.
    pub kind: ExchangeKind,
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
    /// Whether the exchange is removed once its last binding goes.
    pub auto_delete: bool,
    /// Delivery mode applied to messages published through it.
    pub delivery_mode: DeliveryMode,
}

/// Declaration of a queue and its binding to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Queue name.
    pub name: String,
    /// The exchange the queue is bound to.
    pub exchange: ExchangeDescriptor,
    /// Binding pattern matched against routing keys.
    pub routing_key: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Whether the queue is removed once its last consumer goes.
    pub auto_delete: bool,
}

/// Returns the event exchange for `service_name`.
///
/// The exchange is named `{service_name}.events`, routes by topic, is durable
/// and auto-deleted when unused, and publishes persistent messages. The
/// result depends only on `service_name`.
#[must_use]
pub fn event_exchange(service_name: &str) -> ExchangeDescriptor {
    ExchangeDescriptor {
        name: format!("{service_name}.events"),
        kind: ExchangeKind::Topic,
        durable: true,
        auto_delete: true,
        delivery_mode: DeliveryMode::Persistent,
    }
}
