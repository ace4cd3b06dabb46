//! Test transports: mock `Transport` implementations for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hopline_core::error::TransportError;
use hopline_core::exchange::{ExchangeDescriptor, QueueDescriptor};
use hopline_core::message::Message;
use hopline_core::transport::{Delivery, Subscription, Transport};
use tokio::sync::mpsc;

/// A message recorded by [`RecordingTransport::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// Exchange name.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// The published message.
    pub message: Message,
}

#[derive(Debug, Default)]
struct Recorded {
    exchanges: Vec<ExchangeDescriptor>,
    queues: Vec<QueueDescriptor>,
    published: Vec<Published>,
    acked: Vec<(String, u64)>,
    requeued: Vec<(String, u64)>,
    cancelled: Vec<String>,
    consumers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

/// A transport that records every call and always succeeds.
///
/// Consumers get a subscription whose deliveries are fed by
/// [`RecordingTransport::deliver`].
#[derive(Debug, Default)]
pub struct RecordingTransport {
    recorded: Mutex<Recorded>,
}

impl RecordingTransport {
    /// Creates an empty recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all declared exchanges.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn declared_exchanges(&self) -> Vec<ExchangeDescriptor> {
        self.recorded.lock().unwrap().exchanges.clone()
    }

    /// Returns a snapshot of all declared queues.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn declared_queues(&self) -> Vec<QueueDescriptor> {
        self.recorded.lock().unwrap().queues.clone()
    }

    /// Returns a snapshot of all published messages.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<Published> {
        self.recorded.lock().unwrap().published.clone()
    }

    /// Returns the `(queue, tag)` pairs that were acknowledged.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn acked(&self) -> Vec<(String, u64)> {
        self.recorded.lock().unwrap().acked.clone()
    }

    /// Returns the `(queue, tag)` pairs that were requeued.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn requeued(&self) -> Vec<(String, u64)> {
        self.recorded.lock().unwrap().requeued.clone()
    }

    /// Returns the consumer tags that were cancelled.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn cancelled(&self) -> Vec<String> {
        self.recorded.lock().unwrap().cancelled.clone()
    }

    /// Pushes `delivery` to the consumer of its queue.
    ///
    /// # Panics
    ///
    /// Panics if nobody consumes the delivery's queue.
    pub fn deliver(&self, delivery: Delivery) {
        let recorded = self.recorded.lock().unwrap();
        let sender = recorded
            .consumers
            .get(&delivery.queue)
            .expect("no consumer for queue");
        sender.send(delivery).expect("consumer dropped");
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), TransportError> {
        self.recorded.lock().unwrap().exchanges.push(exchange.clone());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), TransportError> {
        self.recorded.lock().unwrap().queues.push(queue.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ExchangeDescriptor,
        message: Message,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.recorded.lock().unwrap().published.push(Published {
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_owned(),
            message,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, TransportError> {
        let (sender, deliveries) = mpsc::unbounded_channel();
        let mut recorded = self.recorded.lock().unwrap();
        recorded.consumers.insert(queue.to_owned(), sender);
        Ok(Subscription {
            consumer_tag: format!("ctag-{queue}"),
            queue: queue.to_owned(),
            deliveries,
        })
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<(), TransportError> {
        self.recorded
            .lock()
            .unwrap()
            .acked
            .push((queue.to_owned(), tag));
        Ok(())
    }

    async fn requeue(&self, queue: &str, tag: u64) -> Result<(), TransportError> {
        self.recorded
            .lock()
            .unwrap()
            .requeued
            .push((queue.to_owned(), tag));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.cancelled.push(consumer_tag.to_owned());
        let queue = consumer_tag.trim_start_matches("ctag-").to_owned();
        recorded.consumers.remove(&queue);
        Ok(())
    }
}

/// A transport that always fails with `TransportError::Unavailable`. Useful
/// for testing error-handling paths.
#[derive(Debug)]
pub struct FailingTransport;

fn unavailable() -> TransportError {
    TransportError::Unavailable("connection refused".into())
}

#[async_trait]
impl Transport for FailingTransport {
    async fn declare_exchange(&self, _exchange: &ExchangeDescriptor) -> Result<(), TransportError> {
        Err(unavailable())
    }

    async fn declare_queue(&self, _queue: &QueueDescriptor) -> Result<(), TransportError> {
        Err(unavailable())
    }

    async fn publish(
        &self,
        _exchange: &ExchangeDescriptor,
        _message: Message,
        _routing_key: &str,
    ) -> Result<(), TransportError> {
        Err(unavailable())
    }

    async fn consume(&self, _queue: &str) -> Result<Subscription, TransportError> {
        Err(unavailable())
    }

    async fn ack(&self, _queue: &str, _tag: u64) -> Result<(), TransportError> {
        Err(unavailable())
    }

    async fn requeue(&self, _queue: &str, _tag: u64) -> Result<(), TransportError> {
        Err(unavailable())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), TransportError> {
        Err(unavailable())
    }
}
