//! Hopline demo entry point.
//!
//! Hosts an `event_raiser` service and a `greeter` service on one in-memory
//! broker, calls `event_raiser.say_hello` over RPC and waits for the greeter
//! to handle the resulting `hello` event. The logs show the call-id stack
//! growing from the caller through both hops.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hopline_broker::InMemoryBroker;
use hopline_container::ServiceContainer;
use hopline_core::config::ContainerConfig;
use hopline_core::context::WorkerContext;
use hopline_core::dispatcher::EventDispatcher;
use hopline_core::error::HandlerError;
use hopline_core::event::TypedEvent;
use hopline_core::handler::{EventHandler, EventHandlerConfig};
use hopline_core::message::ContextData;
use hopline_core::rpc::RpcHandler;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Hello {
    name: String,
}

impl TypedEvent for Hello {
    const KIND: &'static str = "Hello";
    const EVENT_TYPE: &'static str = "hello";
}

struct SayHello {
    dispatcher: EventDispatcher,
}

#[async_trait]
impl RpcHandler for SayHello {
    async fn call(
        &self,
        context: &WorkerContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let name = args[0].as_str().unwrap_or("world").to_owned();
        self.dispatcher
            .dispatch_typed(context, &Hello { name })
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        Ok(json!("sent"))
    }
}

struct Greet {
    done: mpsc::UnboundedSender<Vec<String>>,
}

#[async_trait]
impl EventHandler for Greet {
    async fn handle(
        &self,
        context: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let name = payload["name"].as_str().unwrap_or_default();
        tracing::info!(
            name,
            call_id_stack = ?context.call_id_stack().as_slice(),
            "hello received"
        );
        // The receiver only goes away once the demo is shutting down.
        let _ = self.done.send(context.call_id_stack().to_vec());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Hopline demo");

    // Read configuration from environment.
    let config = ContainerConfig::from_env();
    let broker = Arc::new(InMemoryBroker::new());
    let (done, mut greeted) = mpsc::unbounded_channel();

    let mut greeter = ServiceContainer::builder("greeter", broker.clone())
        .config(config.clone())
        .event_handler(
            "greet",
            EventHandlerConfig::new("event_raiser", Hello::EVENT_TYPE),
            Arc::new(Greet { done }),
        )
        .build()?;
    let mut raiser = ServiceContainer::builder("event_raiser", broker.clone())
        .config(config.clone())
        .rpc(
            "say_hello",
            Arc::new(SayHello {
                dispatcher: EventDispatcher::new("event_raiser", broker.clone()),
            }),
        )
        .build()?;
    let client = ServiceContainer::builder("client", broker.clone())
        .config(config)
        .build()?;

    greeter.start().await?;
    raiser.start().await?;

    let proxy = client
        .rpc_proxy("event_raiser")
        .with_timeout(Duration::from_secs(5));
    let context = client.worker_context("main", ContextData::new());
    let reply = proxy.call(&context, "say_hello", json!(["ferris"])).await?;
    tracing::info!(reply = %reply, "say_hello returned");

    match tokio::time::timeout(Duration::from_secs(5), greeted.recv()).await {
        Ok(Some(stack)) => tracing::info!(depth = stack.len(), "event handled"),
        _ => tracing::warn!("no greeting within five seconds"),
    }

    proxy.close().await?;
    raiser.stop().await?;
    greeter.stop().await?;
    tracing::info!("Hopline demo finished");
    Ok(())
}
