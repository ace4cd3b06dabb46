//! RPC proxy and entrypoint plumbing.
//!
//! Requests are published to the shared `hopline-rpc` topic exchange with
//! routing key `{service}.{method}`. Each serving container consumes the
//! queue `rpc-{service}`. A proxy listens for replies on its own
//! auto-deleted queue, bound with a per-proxy routing key that requests
//! name in their `reply_to` header. The caller's call-id stack travels in
//! the request headers, so the serving worker extends it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::WorkerContext;
use crate::error::{HandlerError, RpcError, TransportError};
use crate::exchange::{DeliveryMode, ExchangeDescriptor, ExchangeKind, QueueDescriptor};
use crate::message::{CORRELATION_ID_HEADER, Message, REPLY_TO_HEADER};
use crate::transport::{Subscription, Transport};

/// Name of the exchange all RPC traffic flows through.
pub const RPC_EXCHANGE_NAME: &str = "hopline-rpc";

/// Returns the RPC exchange.
#[must_use]
pub fn rpc_exchange() -> ExchangeDescriptor {
    ExchangeDescriptor {
        name: RPC_EXCHANGE_NAME.to_owned(),
        kind: ExchangeKind::Topic,
        durable: true,
        auto_delete: false,
        delivery_mode: DeliveryMode::Persistent,
    }
}

/// Returns the queue serving RPC requests for `service_name`.
#[must_use]
pub fn rpc_queue(service_name: &str) -> QueueDescriptor {
    QueueDescriptor {
        name: format!("rpc-{service_name}"),
        exchange: rpc_exchange(),
        routing_key: format!("{service_name}.*"),
        durable: true,
        auto_delete: false,
    }
}

/// Splits an RPC routing key into service and method.
#[must_use]
pub fn split_routing_key(routing_key: &str) -> Option<(&str, &str)> {
    routing_key.rsplit_once('.')
}

/// Trait implemented by RPC entrypoints.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handles one request inside `context`, returning the result payload.
    async fn call(
        &self,
        context: &WorkerContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Body of an RPC reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcReply {
    /// The entrypoint returned a value.
    Result(serde_json::Value),
    /// The entrypoint failed.
    Error {
        /// Machine-readable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

impl RpcReply {
    /// Builds a reply from a handler result.
    #[must_use]
    pub fn from_result(result: Result<serde_json::Value, HandlerError>) -> Self {
        match result {
            Ok(value) => Self::Result(value),
            Err(e) => Self::Error {
                kind: e.kind().to_owned(),
                message: e.to_string(),
            },
        }
    }

    fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error { kind, message } => Err(RpcError::Remote { kind, message }),
        }
    }
}

/// Publishes `reply` to the proxy that sent `request`.
///
/// Requests without a `reply_to` header are fire-and-forget and get no reply.
///
/// # Errors
///
/// Returns `TransportError` if the publish fails.
pub async fn send_reply(
    transport: &dyn Transport,
    request: &Message,
    reply: &RpcReply,
) -> Result<(), TransportError> {
    let Some(reply_to) = request.header_str(REPLY_TO_HEADER) else {
        tracing::debug!("rpc request without reply_to, not replying");
        return Ok(());
    };
    let payload = serde_json::to_value(reply)
        .map_err(|e| TransportError::PreconditionFailed(format!("unserializable reply: {e}")))?;
    let mut message = Message::new(payload);
    if let Some(correlation_id) = request.headers.get(CORRELATION_ID_HEADER) {
        message = message.with_header(CORRELATION_ID_HEADER, correlation_id.clone());
    }
    transport.publish(&rpc_exchange(), message, reply_to).await
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

struct ReplyListener {
    routing_key: String,
    consumer_tag: String,
    pending: PendingReplies,
    task: JoinHandle<()>,
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Client for calling methods of another service.
pub struct RpcProxy {
    target_service: String,
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
    listener: OnceCell<ReplyListener>,
}

impl RpcProxy {
    /// Creates a proxy for `target_service`.
    #[must_use]
    pub fn new(target_service: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            target_service: target_service.into(),
            transport,
            timeout: None,
            listener: OnceCell::new(),
        }
    }

    /// Fails calls that get no reply within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The service this proxy calls.
    #[must_use]
    pub fn target_service(&self) -> &str {
        &self.target_service
    }

    /// Calls `method` on the target service with `args`, carrying
    /// `context`'s call-id stack, and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the request cannot be sent,
    /// `RpcError::Remote` if the remote entrypoint failed,
    /// `RpcError::Timeout` if the proxy's timeout elapsed, and
    /// `RpcError::MalformedReply` for replies that cannot be decoded.
    pub async fn call(
        &self,
        context: &WorkerContext,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let listener = self.listener().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_pending(&listener.pending).insert(correlation_id.clone(), tx);

        let routing_key = format!("{}.{method}", self.target_service);
        let message = Message::new(args)
            .with_headers(context.outgoing_headers())
            .with_header(REPLY_TO_HEADER, listener.routing_key.clone().into())
            .with_header(CORRELATION_ID_HEADER, correlation_id.clone().into());

        tracing::debug!(
            routing_key = %routing_key,
            call_id = %context.call_id(),
            "sending rpc request"
        );
        if let Err(e) = self.transport.publish(&rpc_exchange(), message, &routing_key).await {
            lock_pending(&listener.pending).remove(&correlation_id);
            return Err(e.into());
        }

        let reply = match self.timeout {
            Some(timeout) => {
                if let Ok(reply) = tokio::time::timeout(timeout, rx).await {
                    reply
                } else {
                    lock_pending(&listener.pending).remove(&correlation_id);
                    return Err(RpcError::Timeout(routing_key));
                }
            }
            None => rx.await,
        }
        .map_err(|_| RpcError::Closed)?;

        serde_json::from_value::<RpcReply>(reply.payload)
            .map_err(|e| RpcError::MalformedReply(e.to_string()))?
            .into_result()
    }

    /// Cancels the reply listener, if one was started.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the broker rejects the cancellation.
    pub async fn close(&self) -> Result<(), TransportError> {
        if let Some(listener) = self.listener.get() {
            self.transport.cancel(&listener.consumer_tag).await?;
        }
        Ok(())
    }

    async fn listener(&self) -> Result<&ReplyListener, TransportError> {
        self.listener
            .get_or_try_init(|| async {
                let routing_key = Uuid::new_v4().to_string();
                let queue = QueueDescriptor {
                    name: format!("rpc.reply-{routing_key}"),
                    exchange: rpc_exchange(),
                    routing_key: routing_key.clone(),
                    durable: false,
                    auto_delete: true,
                };
                self.transport.declare_queue(&queue).await?;
                let subscription = self.transport.consume(&queue.name).await?;
                let consumer_tag = subscription.consumer_tag.clone();
                let pending = PendingReplies::default();
                let task = tokio::spawn(route_replies(
                    Arc::clone(&self.transport),
                    subscription,
                    Arc::clone(&pending),
                ));
                Ok::<_, TransportError>(ReplyListener {
                    routing_key,
                    consumer_tag,
                    pending,
                    task,
                })
            })
            .await
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("target_service", &self.target_service)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn route_replies(
    transport: Arc<dyn Transport>,
    mut subscription: Subscription,
    pending: PendingReplies,
) {
    while let Some(delivery) = subscription.deliveries.recv().await {
        if let Err(e) = transport.ack(&delivery.queue, delivery.tag).await {
            tracing::warn!(error = %e, "failed to ack rpc reply");
        }
        let Some(correlation_id) = delivery
            .message
            .header_str(CORRELATION_ID_HEADER)
            .map(str::to_owned)
        else {
            tracing::warn!(queue = %delivery.queue, "dropping rpc reply without correlation id");
            continue;
        };
        let waiter = lock_pending(&pending).remove(&correlation_id);
        if let Some(tx) = waiter {
            // The caller may have timed out and gone away.
            let _ = tx.send(delivery.message);
        } else {
            tracing::debug!(correlation_id = %correlation_id, "no caller waiting for rpc reply");
        }
    }
}

fn lock_pending(
    pending: &PendingReplies,
) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
    // The map stays consistent even if a holder panicked.
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_rpc_queue_binds_every_method_of_the_service() {
        let queue = rpc_queue("child");

        assert_eq!(queue.name, "rpc-child");
        assert_eq!(queue.routing_key, "child.*");
        assert_eq!(queue.exchange.name, RPC_EXCHANGE_NAME);
        assert!(!queue.auto_delete);
    }

    #[test]
    fn test_split_routing_key() {
        assert_eq!(split_routing_key("child.child_do"), Some(("child", "child_do")));
        assert_eq!(split_routing_key("nodot"), None);
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            serde_json::to_value(RpcReply::Result(json!(1))).unwrap(),
            json!({"result": 1})
        );

        let error = RpcReply::from_result(Err(HandlerError::Failed("boom".to_owned())));
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error": {"kind": "HandlerFailed", "message": "handler failed: boom"}})
        );
        assert!(matches!(
            error.into_result(),
            Err(RpcError::Remote { kind, .. }) if kind == "HandlerFailed"
        ));
    }
}
