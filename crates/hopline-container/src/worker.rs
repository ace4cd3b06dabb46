//! Consumer loops and worker execution.
//!
//! Each consumer loop takes a permit from the container's worker pool before
//! spawning a worker for a delivery, so at most `MAX_WORKERS` entrypoint
//! invocations run at once per container.

use std::sync::Arc;

use hopline_core::context::{Entrypoint, WorkerContext};
use hopline_core::error::{HandlerError, TransportError};
use hopline_core::handler::{EventHandler, HandlerRegistration, settle_event_delivery};
use hopline_core::message::ContextData;
use hopline_core::rpc::{RpcHandler, RpcReply, send_reply, split_routing_key};
use hopline_core::transport::{Delivery, Subscription};
use tracing::Instrument;

use crate::container::Host;

/// An event entrypoint as seen by its consumer loop.
pub(crate) struct EventBinding {
    pub(crate) entrypoint: Entrypoint,
    pub(crate) registration: Arc<HandlerRegistration>,
    pub(crate) handler: Arc<dyn EventHandler>,
}

pub(crate) async fn consume_events(
    host: Arc<Host>,
    binding: EventBinding,
    mut subscription: Subscription,
) {
    while let Some(delivery) = subscription.deliveries.recv().await {
        let Ok(permit) = Arc::clone(&host.workers).acquire_owned().await else {
            break;
        };
        let host = Arc::clone(&host);
        let entrypoint = binding.entrypoint.clone();
        let registration = Arc::clone(&binding.registration);
        let handler = Arc::clone(&binding.handler);
        tokio::spawn(async move {
            handle_event(&host, &entrypoint, &registration, handler.as_ref(), delivery).await;
            drop(permit);
        });
    }
    tracing::debug!(queue = %subscription.queue, "event consumer finished");
}

async fn handle_event(
    host: &Host,
    entrypoint: &Entrypoint,
    registration: &HandlerRegistration,
    handler: &dyn EventHandler,
    delivery: Delivery,
) {
    let context = WorkerContext::builder(host, entrypoint)
        .data(delivery.message.context_data())
        .build();
    let span = tracing::info_span!(
        "worker",
        call_id = %context.call_id(),
        service = %host.service_name,
        entrypoint = %entrypoint.name,
    );
    let queue = delivery.queue.clone();
    let tag = delivery.tag;
    match settle_event_delivery(host.transport.as_ref(), registration, handler, &context, delivery)
        .instrument(span)
        .await
    {
        Ok(outcome) => tracing::debug!(queue = %queue, tag, ?outcome, "event settled"),
        // Auto-delete queues vanish with their last consumer, taking the
        // unsettled deliveries with them.
        Err(TransportError::QueueNotFound(_)) => {
            tracing::debug!(queue = %queue, tag, "queue removed before the event was settled");
        }
        Err(e) => tracing::error!(error = %e, queue = %queue, tag, "failed to settle event"),
    }
}

pub(crate) async fn consume_rpc(host: Arc<Host>, mut subscription: Subscription) {
    while let Some(delivery) = subscription.deliveries.recv().await {
        let Ok(permit) = Arc::clone(&host.workers).acquire_owned().await else {
            break;
        };
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            handle_request(&host, delivery).await;
            drop(permit);
        });
    }
    tracing::debug!(queue = %subscription.queue, "rpc consumer finished");
}

async fn handle_request(host: &Host, delivery: Delivery) {
    let method = split_routing_key(&delivery.routing_key).map(|(_, method)| method.to_owned());
    let handler = method
        .as_deref()
        .and_then(|method| host.rpc_handlers.get(method));

    let reply = match (method.as_deref(), handler) {
        (Some(method), Some(handler)) => {
            let result = run_rpc(
                host,
                handler.as_ref(),
                method,
                delivery.message.payload.clone(),
                delivery.message.context_data(),
            )
            .await;
            RpcReply::from_result(result)
        }
        _ => {
            tracing::warn!(routing_key = %delivery.routing_key, "rpc request for unknown method");
            RpcReply::Error {
                kind: "UnknownMethod".to_owned(),
                message: format!("{} has no method {}", host.service_name, delivery.routing_key),
            }
        }
    };

    if let Err(e) = send_reply(host.transport.as_ref(), &delivery.message, &reply).await {
        tracing::error!(error = %e, routing_key = %delivery.routing_key, "failed to send rpc reply");
    }
    match host.transport.ack(&delivery.queue, delivery.tag).await {
        Ok(()) => {}
        Err(TransportError::QueueNotFound(_)) => {
            tracing::debug!(queue = %delivery.queue, "queue removed before the request was acked");
        }
        Err(e) => tracing::error!(error = %e, queue = %delivery.queue, "failed to ack rpc request"),
    }
}

/// Runs one RPC entrypoint invocation inside a fresh worker context.
pub(crate) async fn run_rpc(
    host: &Host,
    handler: &dyn RpcHandler,
    method: &str,
    args: serde_json::Value,
    data: ContextData,
) -> Result<serde_json::Value, HandlerError> {
    let entrypoint = Entrypoint::new(method);
    let positional = match &args {
        serde_json::Value::Array(values) => values.clone(),
        _ => Vec::new(),
    };
    let keyword = match &args {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let context = WorkerContext::builder(host, &entrypoint)
        .args(positional)
        .kwargs(keyword)
        .data(data)
        .build();
    let span = tracing::info_span!(
        "worker",
        call_id = %context.call_id(),
        service = %host.service_name,
        entrypoint = %method,
    );
    let result = handler.call(&context, args).instrument(span).await;
    if let Err(e) = &result {
        tracing::warn!(error = %e, call_id = %context.call_id(), "rpc entrypoint failed");
    }
    result
}
