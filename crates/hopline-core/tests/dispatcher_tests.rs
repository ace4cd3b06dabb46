//! Integration tests for `EventDispatcher`.

use std::sync::Arc;

use hopline_core::context::{Entrypoint, WorkerContext};
use hopline_core::error::{DispatchError, TransportError};
use hopline_core::event::{EventKind, TypedEvent};
use hopline_core::exchange::event_exchange;
use hopline_core::message::CALL_ID_STACK_HEADER;
use hopline_core::dispatcher::EventDispatcher;
use hopline_test_support::{FailingTransport, RecordingTransport, StubContainer};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct SpamEmitted {
    ham: String,
}

impl TypedEvent for SpamEmitted {
    const KIND: &'static str = "SpamEmitted";
    const EVENT_TYPE: &'static str = "spam.ham";
}

fn context(container: &StubContainer, entrypoint: &str) -> WorkerContext {
    WorkerContext::builder(container, &Entrypoint::new(entrypoint)).build()
}

#[tokio::test]
async fn test_dispatch_publishes_to_service_exchange_with_event_type_routing_key() {
    // Arrange
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = EventDispatcher::new("srcservice", transport.clone());
    let container = StubContainer::new("srcservice");
    let kind = EventKind::define("Greeting", Some("hello")).unwrap();
    let ctx = context(&container, "say_hello");

    // Act
    dispatcher
        .dispatch(&ctx, &kind.event(json!({"name": "ferris"})))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        transport.declared_exchanges(),
        vec![event_exchange("srcservice")]
    );
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "srcservice.events");
    assert_eq!(published[0].routing_key, "hello");
    assert_eq!(published[0].message.payload, json!({"name": "ferris"}));
    assert_eq!(
        published[0].message.headers[CALL_ID_STACK_HEADER],
        json!(["srcservice.say_hello.0"])
    );
}

#[tokio::test]
async fn test_exchange_is_declared_before_every_publish() {
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = EventDispatcher::new("srcservice", transport.clone());
    let container = StubContainer::new("srcservice");
    let kind = EventKind::define("Greeting", Some("hello")).unwrap();

    dispatcher.start().await.unwrap();
    for _ in 0..3 {
        let ctx = context(&container, "say_hello");
        dispatcher.dispatch(&ctx, &kind.event(json!(null))).await.unwrap();
    }

    assert_eq!(
        transport.declared_exchanges(),
        vec![event_exchange("srcservice"); 4]
    );
    assert_eq!(transport.published().len(), 3);
}

#[tokio::test]
async fn test_dispatch_typed_serializes_event() {
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = EventDispatcher::new("spammer", transport.clone());
    let container = StubContainer::new("spammer");
    let ctx = context(&container, "emit_spam");

    dispatcher
        .dispatch_typed(
            &ctx,
            &SpamEmitted {
                ham: "eggs".to_owned(),
            },
        )
        .await
        .unwrap();

    let published = transport.published();
    assert_eq!(published[0].routing_key, "spam.ham");
    assert_eq!(published[0].message.payload, json!({"ham": "eggs"}));
}

#[tokio::test]
async fn test_transport_failure_propagates_to_caller() {
    let dispatcher = EventDispatcher::new("srcservice", Arc::new(FailingTransport));
    let container = StubContainer::new("srcservice");
    let kind = EventKind::define("Greeting", Some("hello")).unwrap();
    let ctx = context(&container, "say_hello");

    let result = dispatcher.dispatch(&ctx, &kind.event(json!(1))).await;

    assert!(matches!(
        result,
        Err(DispatchError::Transport(TransportError::Unavailable(_)))
    ));
}
