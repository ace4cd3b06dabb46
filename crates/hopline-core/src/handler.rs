//! Event handler registration.
//!
//! A registration records which events of which source service a handler
//! listens to and with what delivery topology. All three topologies share
//! the source service's event exchange and use the event type as routing
//! key; they differ only in how the consuming queue is named:
//!
//! - [`HandlerType::ServicePool`]: one queue per destination service type.
//!   Every listening service type gets each event once, delivered to one
//!   of its instances.
//! - [`HandlerType::Singleton`]: one queue for all listeners. Each event is
//!   handled by exactly one instance anywhere; a requeued event may go to a
//!   different one.
//! - [`HandlerType::Broadcast`]: one queue per listening instance. Every
//!   instance gets every event. Cannot be combined with reliable delivery.

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::WorkerContext;
use crate::error::{ConfigurationError, HandlerError, TransportError};
use crate::exchange::{QueueDescriptor, event_exchange};
use crate::transport::{Delivery, Transport};

/// Delivery topology of an event handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HandlerType {
    /// One delivery per listening service type.
    #[default]
    ServicePool,
    /// One delivery in total.
    Singleton,
    /// One delivery per listening instance.
    Broadcast,
}

impl HandlerType {
    /// Derives the queue name for this topology.
    ///
    /// `instance_id` is only used by [`HandlerType::Broadcast`].
    #[must_use]
    pub fn queue_name(
        self,
        source_service: &str,
        event_type: &str,
        destination_service: &str,
        instance_id: Uuid,
    ) -> String {
        match self {
            Self::ServicePool => format!("evt-{source_service}-{event_type}-{destination_service}"),
            Self::Singleton => format!("evt-{source_service}-{event_type}"),
            Self::Broadcast => format!("evt-{source_service}-{event_type}-{instance_id}"),
        }
    }
}

/// Options of an event handler, with the defaults of
/// [`register_event_handler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandlerConfig {
    source_service: String,
    event_type: String,
    handler_type: HandlerType,
    reliable_delivery: bool,
    requeue_on_error: bool,
}

impl EventHandlerConfig {
    /// Handler for `event_type` events of `source_service`, pooled by
    /// service type, with reliable delivery and no requeue on error.
    #[must_use]
    pub fn new(source_service: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            event_type: event_type.into(),
            handler_type: HandlerType::ServicePool,
            reliable_delivery: true,
            requeue_on_error: false,
        }
    }

    /// Sets the delivery topology.
    #[must_use]
    pub fn handler_type(mut self, handler_type: HandlerType) -> Self {
        self.handler_type = handler_type;
        self
    }

    /// Keeps events queued while no handler is consuming.
    #[must_use]
    pub fn reliable_delivery(mut self, reliable_delivery: bool) -> Self {
        self.reliable_delivery = reliable_delivery;
        self
    }

    /// Returns events to the queue when the handler fails.
    #[must_use]
    pub fn requeue_on_error(mut self, requeue_on_error: bool) -> Self {
        self.requeue_on_error = requeue_on_error;
        self
    }

    /// Validates the options and returns a bound registration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::EventHandlerConfiguration` for a
    /// broadcast handler with reliable delivery, or an empty event type.
    pub fn register(self) -> Result<HandlerRegistration, ConfigurationError> {
        if self.reliable_delivery && self.handler_type == HandlerType::Broadcast {
            return Err(ConfigurationError::EventHandlerConfiguration(
                "broadcast event handlers cannot be configured with reliable delivery".to_owned(),
            ));
        }
        if self.event_type.is_empty() {
            return Err(ConfigurationError::EventHandlerConfiguration(format!(
                "handler for {} events needs an event type",
                self.source_service
            )));
        }
        Ok(HandlerRegistration {
            config: self,
            state: RegistrationState::Bound,
            queue: None,
            consumer_tag: None,
        })
    }
}

/// Registers a handler for `event_type` events emitted by `source_service`.
///
/// # Errors
///
/// See [`EventHandlerConfig::register`].
pub fn register_event_handler(
    source_service: &str,
    event_type: &str,
    handler_type: HandlerType,
    reliable_delivery: bool,
    requeue_on_error: bool,
) -> Result<HandlerRegistration, ConfigurationError> {
    EventHandlerConfig::new(source_service, event_type)
        .handler_type(handler_type)
        .reliable_delivery(reliable_delivery)
        .requeue_on_error(requeue_on_error)
        .register()
}

/// Lifecycle of a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Options not yet validated.
    Unbound,
    /// Validated, waiting for the container to start.
    Bound,
    /// Queue declared and consumed.
    Consuming,
    /// Subscription released.
    Stopped,
}

impl RegistrationState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Consuming => "consuming",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated event handler registration, driven by the container lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    config: EventHandlerConfig,
    state: RegistrationState,
    queue: Option<QueueDescriptor>,
    consumer_tag: Option<String>,
}

impl HandlerRegistration {
    /// Source service whose events are handled.
    #[must_use]
    pub fn source_service(&self) -> &str {
        &self.config.source_service
    }

    /// Event type (routing pattern) handled.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.config.event_type
    }

    /// Delivery topology.
    #[must_use]
    pub fn handler_type(&self) -> HandlerType {
        self.config.handler_type
    }

    /// Whether events stay queued while nobody consumes.
    #[must_use]
    pub fn reliable_delivery(&self) -> bool {
        self.config.reliable_delivery
    }

    /// Whether failed events go back to the queue.
    #[must_use]
    pub fn requeue_on_error(&self) -> bool {
        self.config.requeue_on_error
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// The queue being consumed, once consuming.
    #[must_use]
    pub fn queue(&self) -> Option<&QueueDescriptor> {
        self.queue.as_ref()
    }

    /// Derives the queue this registration consumes when hosted by
    /// `destination_service`.
    ///
    /// Broadcast registrations get a fresh instance id on every call, so
    /// their queue names never repeat.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidTransition` unless the
    /// registration is bound.
    pub fn queue_for(&self, destination_service: &str) -> Result<QueueDescriptor, ConfigurationError> {
        self.expect_state(RegistrationState::Bound, RegistrationState::Consuming)?;
        let config = &self.config;
        Ok(QueueDescriptor {
            name: config.handler_type.queue_name(
                &config.source_service,
                &config.event_type,
                destination_service,
                Uuid::new_v4(),
            ),
            exchange: event_exchange(&config.source_service),
            routing_key: config.event_type.clone(),
            durable: true,
            auto_delete: !config.reliable_delivery,
        })
    }

    /// Records that `queue` is declared and consumed under `consumer_tag`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidTransition` unless the
    /// registration is bound.
    pub fn mark_consuming(
        &mut self,
        queue: QueueDescriptor,
        consumer_tag: String,
    ) -> Result<(), ConfigurationError> {
        self.expect_state(RegistrationState::Bound, RegistrationState::Consuming)?;
        self.queue = Some(queue);
        self.consumer_tag = Some(consumer_tag);
        self.state = RegistrationState::Consuming;
        Ok(())
    }

    /// Moves the registration to stopped, returning the consumer tag to cancel.
    ///
    /// Stopping twice is a no-op returning `None`.
    pub fn mark_stopped(&mut self) -> Option<String> {
        self.state = RegistrationState::Stopped;
        self.consumer_tag.take()
    }

    fn expect_state(
        &self,
        expected: RegistrationState,
        to: RegistrationState,
    ) -> Result<(), ConfigurationError> {
        if self.state == expected {
            return Ok(());
        }
        Err(ConfigurationError::InvalidTransition {
            queue: self
                .queue
                .as_ref()
                .map_or_else(|| self.config.event_type.clone(), |q| q.name.clone()),
            from: self.state.as_str(),
            to: to.as_str(),
        })
    }
}

/// Trait implemented by event handling entrypoints.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event payload inside `context`.
    async fn handle(
        &self,
        context: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError>;
}

/// What happened to a delivery after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled, acknowledged.
    Acked,
    /// Handler failed, acknowledged and dropped.
    Dropped,
    /// Handler failed, returned to the queue.
    Requeued,
}

/// Runs `handler` for `delivery` and settles the delivery with the broker.
///
/// Handler errors never propagate: the delivery is requeued when the
/// registration asks for it and acknowledged otherwise.
///
/// # Errors
///
/// Returns `TransportError` only if the ack or requeue itself fails.
pub async fn settle_event_delivery(
    transport: &dyn Transport,
    registration: &HandlerRegistration,
    handler: &dyn EventHandler,
    context: &WorkerContext,
    delivery: Delivery,
) -> Result<DeliveryOutcome, TransportError> {
    let Delivery {
        queue, tag, message, ..
    } = delivery;
    match handler.handle(context, message.payload).await {
        Ok(()) => {
            transport.ack(&queue, tag).await?;
            Ok(DeliveryOutcome::Acked)
        }
        Err(e) if registration.requeue_on_error() => {
            tracing::warn!(error = %e, queue = %queue, "event handler failed, requeueing");
            transport.requeue(&queue, tag).await?;
            Ok(DeliveryOutcome::Requeued)
        }
        Err(e) => {
            tracing::warn!(error = %e, queue = %queue, "event handler failed, dropping event");
            transport.ack(&queue, tag).await?;
            Ok(DeliveryOutcome::Dropped)
        }
    }
}
