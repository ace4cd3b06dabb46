//! Broker transport abstraction.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::exchange::{ExchangeDescriptor, QueueDescriptor};
use crate::message::Message;

/// A message handed to a consumer, awaiting ack or requeue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Broker-assigned tag used to ack or requeue this delivery.
    pub tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// The delivered message.
    pub message: Message,
    /// Whether the message was delivered before and requeued.
    pub redelivered: bool,
}

/// An active consumer on a queue.
#[derive(Debug)]
pub struct Subscription {
    /// Tag identifying the consumer, used to cancel it.
    pub consumer_tag: String,
    /// Queue being consumed.
    pub queue: String,
    /// Stream of deliveries. Closes when the consumer is cancelled.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Transport trait implemented by the message broker.
///
/// Declarations are idempotent: redeclaring an exchange or queue with the
/// same properties is a no-op.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange if absent.
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), TransportError>;

    /// Declares a queue if absent and binds it to its exchange.
    ///
    /// The queue's exchange is declared as well.
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), TransportError>;

    /// Publishes `message` to `exchange` with `routing_key`.
    ///
    /// Returns once the broker has accepted the message. Acceptance says
    /// nothing about whether any queue received it.
    async fn publish(
        &self,
        exchange: &ExchangeDescriptor,
        message: Message,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Starts consuming `queue`.
    async fn consume(&self, queue: &str) -> Result<Subscription, TransportError>;

    /// Acknowledges a delivery, removing the message from its queue.
    async fn ack(&self, queue: &str, tag: u64) -> Result<(), TransportError>;

    /// Returns a delivery to the front of its queue for redelivery.
    async fn requeue(&self, queue: &str, tag: u64) -> Result<(), TransportError>;

    /// Cancels a consumer.
    ///
    /// Deliveries already handed to the consumer stay unacknowledged until
    /// settled. The last consumer of an auto-delete queue deletes the queue.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;
}
