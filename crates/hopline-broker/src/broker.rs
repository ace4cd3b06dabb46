//! In-memory broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use hopline_core::error::TransportError;
use hopline_core::exchange::{ExchangeDescriptor, ExchangeKind, QueueDescriptor};
use hopline_core::message::Message;
use hopline_core::transport::{Delivery, Subscription, Transport};

use crate::topic;

/// A message waiting in, or handed out from, a queue.
#[derive(Debug, Clone)]
struct QueuedMessage {
    message: Message,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct QueueState {
    descriptor: QueueDescriptor,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, QueuedMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl QueueState {
    fn new(descriptor: QueueDescriptor) -> Self {
        Self {
            descriptor,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    exchanges: HashMap<String, ExchangeDescriptor>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            exchanges: HashMap::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            next_delivery_tag: 1,
            next_consumer_tag: 1,
        }
    }
}

impl BrokerState {
    fn check_available(&self) -> Result<(), TransportError> {
        if self.available {
            Ok(())
        } else {
            Err(TransportError::Unavailable("broker is down".to_owned()))
        }
    }

    fn declare_exchange(&mut self, exchange: &ExchangeDescriptor) -> Result<(), TransportError> {
        match self.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(TransportError::PreconditionFailed(
                format!("exchange {} redeclared with different properties", exchange.name),
            )),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(exchange = %exchange.name, "exchange declared");
                self.exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    /// Hands ready messages of `queue` to its consumers, round-robin.
    fn pump(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        while !state.consumers.is_empty() {
            let Some(queued) = state.ready.pop_front() else {
                break;
            };
            let index = state.next_consumer % state.consumers.len();
            let tag = self.next_delivery_tag;
            let delivery = Delivery {
                queue: queue.to_owned(),
                tag,
                routing_key: queued.routing_key.clone(),
                message: queued.message.clone(),
                redelivered: queued.redelivered,
            };
            if state.consumers[index].sender.send(delivery).is_err() {
                // Receiver dropped without cancelling.
                state.consumers.remove(index);
                state.ready.push_front(queued);
                continue;
            }
            self.next_delivery_tag += 1;
            state.next_consumer = index + 1;
            state.unacked.insert(tag, queued);
        }
    }

    fn route(&self, exchange: &ExchangeDescriptor, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange.name) {
            let matched = match exchange.kind {
                ExchangeKind::Topic => topic::matches(&binding.pattern, routing_key),
                ExchangeKind::Direct => binding.pattern == routing_key,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }

    fn delete_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        let (removed, kept): (Vec<Binding>, Vec<Binding>) = std::mem::take(&mut self.bindings)
            .into_iter()
            .partition(|b| b.queue == queue);
        self.bindings = kept;
        tracing::debug!(queue, "auto-delete queue removed");

        for binding in removed {
            let unused = !self.bindings.iter().any(|b| b.exchange == binding.exchange);
            let auto_delete = self
                .exchanges
                .get(&binding.exchange)
                .is_some_and(|e| e.auto_delete);
            if unused && auto_delete {
                self.exchanges.remove(&binding.exchange);
                tracing::debug!(exchange = %binding.exchange, "auto-delete exchange removed");
            }
        }
    }

    fn queue_mut(&mut self, queue: &str) -> Result<&mut QueueState, TransportError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_owned()))
    }
}

/// Transport backed by in-process exchanges and queues.
///
/// Clone an `Arc<InMemoryBroker>` into every container that should talk to
/// the same broker.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    /// Creates an empty, available broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while unavailable every operation fails with
    /// `TransportError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Returns `true` if an exchange named `name` exists.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Returns `true` if a queue named `name` exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Returns the names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the declaration of queue `name`.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<QueueDescriptor> {
        self.lock().queues.get(name).map(|q| q.descriptor.clone())
    }

    /// Number of messages waiting in `name` for a consumer.
    #[must_use]
    pub fn ready_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    /// Number of messages of `name` handed out but not yet settled.
    #[must_use]
    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.unacked.len())
    }

    /// Number of consumers attached to `name`.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.consumers.len())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // Every mutation leaves the state consistent, so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        state.declare_exchange(exchange)
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        state.declare_exchange(&queue.exchange)?;

        if let Some(existing) = state.queues.get(&queue.name) {
            let existing = &existing.descriptor;
            if existing.durable != queue.durable || existing.auto_delete != queue.auto_delete {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue {} redeclared with different properties",
                    queue.name
                )));
            }
        } else {
            tracing::debug!(queue = %queue.name, "queue declared");
            state
                .queues
                .insert(queue.name.clone(), QueueState::new(queue.clone()));
        }

        let binding = Binding {
            exchange: queue.exchange.name.clone(),
            pattern: queue.routing_key.clone(),
            queue: queue.name.clone(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ExchangeDescriptor,
        message: Message,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        if !state.exchanges.contains_key(&exchange.name) {
            return Err(TransportError::ExchangeNotFound(exchange.name.clone()));
        }

        let targets = state.route(exchange, routing_key);
        tracing::debug!(
            exchange = %exchange.name,
            routing_key,
            queues = targets.len(),
            "message published"
        );
        for queue in targets {
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                queue_state.ready.push_back(QueuedMessage {
                    message: message.clone(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                });
            }
            state.pump(&queue);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        let consumer_tag = format!("ctag-{}", state.next_consumer_tag);
        state.next_consumer_tag += 1;

        let (sender, deliveries) = mpsc::unbounded_channel();
        state.queue_mut(queue)?.consumers.push(Consumer {
            tag: consumer_tag.clone(),
            sender,
        });
        state.pump(queue);

        Ok(Subscription {
            consumer_tag,
            queue: queue.to_owned(),
            deliveries,
        })
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        state
            .queue_mut(queue)?
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: queue.to_owned(),
                tag,
            })
    }

    async fn requeue(&self, queue: &str, tag: u64) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        let queue_state = state.queue_mut(queue)?;
        let mut queued =
            queue_state
                .unacked
                .remove(&tag)
                .ok_or_else(|| TransportError::UnknownDelivery {
                    queue: queue.to_owned(),
                    tag,
                })?;
        queued.redelivered = true;
        queue_state.ready.push_front(queued);
        state.pump(queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check_available()?;
        let owner = state.queues.iter_mut().find_map(|(name, queue)| {
            let index = queue.consumers.iter().position(|c| c.tag == consumer_tag)?;
            queue.consumers.remove(index);
            Some((
                name.clone(),
                queue.consumers.is_empty() && queue.descriptor.auto_delete,
            ))
        });
        match owner {
            Some((queue, true)) => {
                state.delete_queue(&queue);
                Ok(())
            }
            Some(_) => Ok(()),
            // Already gone, e.g. its auto-delete queue was removed.
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use hopline_core::exchange::event_exchange;
    use serde_json::json;

    use super::*;

    fn queue(name: &str, routing_key: &str, auto_delete: bool) -> QueueDescriptor {
        QueueDescriptor {
            name: name.to_owned(),
            exchange: event_exchange("src"),
            routing_key: routing_key.to_owned(),
            durable: true,
            auto_delete,
        }
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let broker = InMemoryBroker::new();

        let result = broker
            .publish(&event_exchange("nobody"), Message::new(json!(1)), "hello")
            .await;

        assert_eq!(
            result,
            Err(TransportError::ExchangeNotFound("nobody.events".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_messages_without_bindings_are_dropped() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(&event_exchange("src")).await.unwrap();

        broker
            .publish(&event_exchange("src"), Message::new(json!(1)), "hello")
            .await
            .unwrap();

        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "hello", false)).await.unwrap();

        broker
            .publish(&event_exchange("src"), Message::new(json!("hi")), "hello")
            .await
            .unwrap();
        assert_eq!(broker.ready_count("q"), Some(1));

        let mut subscription = broker.consume("q").await.unwrap();
        let delivery = subscription.deliveries.recv().await.unwrap();

        assert_eq!(delivery.message.payload, json!("hi"));
        assert_eq!(delivery.routing_key, "hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("q"), Some(1));

        broker.ack("q", delivery.tag).await.unwrap();
        assert_eq!(broker.unacked_count("q"), Some(0));
    }

    #[tokio::test]
    async fn test_consumers_of_one_queue_share_messages_round_robin() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "hello", false)).await.unwrap();
        let mut first = broker.consume("q").await.unwrap();
        let mut second = broker.consume("q").await.unwrap();

        for n in 0..4 {
            broker
                .publish(&event_exchange("src"), Message::new(json!(n)), "hello")
                .await
                .unwrap();
        }

        let mut first_payloads = Vec::new();
        while let Ok(delivery) = first.deliveries.try_recv() {
            first_payloads.push(delivery.message.payload);
        }
        let mut second_payloads = Vec::new();
        while let Ok(delivery) = second.deliveries.try_recv() {
            second_payloads.push(delivery.message.payload);
        }
        assert_eq!(first_payloads, vec![json!(0), json!(2)]);
        assert_eq!(second_payloads, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_requeued_message_is_redelivered_first() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "#", false)).await.unwrap();
        let exchange = event_exchange("src");
        broker.publish(&exchange, Message::new(json!("a")), "x").await.unwrap();
        broker.publish(&exchange, Message::new(json!("b")), "y").await.unwrap();

        let mut subscription = broker.consume("q").await.unwrap();
        let a = subscription.deliveries.recv().await.unwrap();
        let b = subscription.deliveries.recv().await.unwrap();
        broker.ack("q", b.tag).await.unwrap();
        broker.requeue("q", a.tag).await.unwrap();

        let again = subscription.deliveries.recv().await.unwrap();
        assert_eq!(again.message.payload, json!("a"));
        assert!(again.redelivered);
        assert_ne!(again.tag, a.tag);
        assert_eq!(
            broker.ack("q", a.tag).await,
            Err(TransportError::UnknownDelivery {
                queue: "q".to_owned(),
                tag: a.tag
            })
        );
    }

    #[tokio::test]
    async fn test_auto_delete_queue_and_exchange_go_with_last_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "hello", true)).await.unwrap();
        let subscription = broker.consume("q").await.unwrap();

        broker.cancel(&subscription.consumer_tag).await.unwrap();

        assert!(!broker.has_queue("q"));
        assert!(!broker.has_exchange("src.events"));
    }

    #[tokio::test]
    async fn test_durable_queue_survives_its_consumers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "hello", false)).await.unwrap();
        let subscription = broker.consume("q").await.unwrap();
        broker.cancel(&subscription.consumer_tag).await.unwrap();

        broker
            .publish(&event_exchange("src"), Message::new(json!(1)), "hello")
            .await
            .unwrap();

        assert_eq!(broker.ready_count("q"), Some(1));
        assert_eq!(broker.consumer_count("q"), Some(0));
    }

    #[tokio::test]
    async fn test_redeclaring_with_different_properties_fails() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&queue("q", "hello", false)).await.unwrap();

        let result = broker.declare_queue(&queue("q", "hello", true)).await;

        assert!(matches!(result, Err(TransportError::PreconditionFailed(_))));
        assert!(broker.declare_queue(&queue("q", "hello", false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_everything() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(&event_exchange("src")).await.unwrap();
        broker.set_available(false);

        let result = broker
            .publish(&event_exchange("src"), Message::new(json!(1)), "hello")
            .await;

        assert!(matches!(result, Err(TransportError::Unavailable(_))));

        broker.set_available(true);
        assert!(
            broker
                .publish(&event_exchange("src"), Message::new(json!(1)), "hello")
                .await
                .is_ok()
        );
    }
}
