//! Event dispatcher.
//!
//! Events are published to the dispatching service's event exchange,
//! `{service_name}.events`, with the event type as routing key. The
//! exchange is declared before every publish, since an auto-delete exchange
//! goes away with its last binding and a redeclare is a no-op. Dispatch returns as soon as the
//! broker has accepted the message: nothing guarantees that any service
//! receives or handles it.

use std::sync::Arc;

use crate::context::WorkerContext;
use crate::error::{DispatchError, TransportError};
use crate::event::{Event, TypedEvent};
use crate::exchange::{ExchangeDescriptor, event_exchange};
use crate::message::Message;
use crate::transport::Transport;

/// Publishes events on behalf of one service.
pub struct EventDispatcher {
    service_name: String,
    transport: Arc<dyn Transport>,
    exchange: ExchangeDescriptor,
}

impl EventDispatcher {
    /// Creates a dispatcher for `service_name`'s events.
    #[must_use]
    pub fn new(service_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let service_name = service_name.into();
        Self {
            exchange: event_exchange(&service_name),
            service_name,
            transport,
        }
    }

    /// Name of the service whose exchange this dispatcher publishes to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Declares the service's event exchange.
    ///
    /// Declaring an exchange that already exists with the same properties
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the declaration fails.
    pub async fn start(&self) -> Result<&ExchangeDescriptor, TransportError> {
        self.transport.declare_exchange(&self.exchange).await?;
        tracing::debug!(exchange = %self.exchange.name, "event exchange declared");
        Ok(&self.exchange)
    }

    /// Publishes `event`, carrying `context`'s call-id stack.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Transport` if the exchange cannot be declared
    /// or the publish fails. No retry is attempted.
    pub async fn dispatch(&self, context: &WorkerContext, event: &Event) -> Result<(), DispatchError> {
        let exchange = self.start().await?;
        let message = Message::new(event.data().clone()).with_headers(context.outgoing_headers());
        let routing_key = event.event_type().as_str();

        tracing::debug!(
            exchange = %exchange.name,
            routing_key,
            call_id = %context.call_id(),
            "dispatching event"
        );
        self.transport.publish(exchange, message, routing_key).await?;
        Ok(())
    }

    /// Serializes and publishes a typed event.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the event kind is invalid,
    /// `DispatchError::Serialization` if the event cannot be serialized, and
    /// otherwise the errors of [`dispatch`](Self::dispatch).
    pub async fn dispatch_typed<E: TypedEvent + Sync>(
        &self,
        context: &WorkerContext,
        event: &E,
    ) -> Result<(), DispatchError> {
        let () = E::VALID_EVENT_TYPE;
        let kind = E::kind()?;
        let event = kind.event(serde_json::to_value(event)?);
        self.dispatch(context, &event).await
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("service_name", &self.service_name)
            .field("exchange", &self.exchange.name)
            .finish_non_exhaustive()
    }
}
