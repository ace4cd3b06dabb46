//! Integration tests for call-id stacks across RPC calls and events.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hopline_broker::InMemoryBroker;
use hopline_container::ServiceContainer;
use hopline_core::config::{ContainerConfig, PARENT_CALLS_CONFIG_KEY};
use hopline_core::context::WorkerContext;
use hopline_core::dispatcher::EventDispatcher;
use hopline_core::error::HandlerError;
use hopline_core::event::EventKind;
use hopline_core::handler::EventHandlerConfig;
use hopline_core::message::{CALL_ID_STACK_HEADER, ContextData};
use hopline_core::rpc::{RpcHandler, RpcProxy};
use hopline_test_support::CountingSequence;
use serde_json::json;
use tokio::sync::mpsc;

type Seen = Arc<Mutex<Vec<(String, Vec<String>)>>>;

/// Records its inherited stack and either calls the next service or
/// returns its own stack.
struct Hop {
    seen: Seen,
    downstream: Option<(RpcProxy, &'static str)>,
}

#[async_trait]
impl RpcHandler for Hop {
    async fn call(
        &self,
        context: &WorkerContext,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        self.seen.lock().unwrap().push((
            context.call_id().to_string(),
            context.parent_call_ids().to_vec(),
        ));
        match &self.downstream {
            Some((proxy, method)) => proxy
                .call(context, method, json!([]))
                .await
                .map_err(|e| HandlerError::Failed(e.to_string())),
            None => Ok(json!(context.call_id_stack().to_vec())),
        }
    }
}

/// Dispatches a `hello` event.
struct SayHello {
    dispatcher: EventDispatcher,
}

#[async_trait]
impl RpcHandler for SayHello {
    async fn call(
        &self,
        context: &WorkerContext,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let kind = EventKind::define("Hello", Some("hello"))
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        self.dispatcher
            .dispatch(context, &kind.event(json!("hello")))
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        Ok(serde_json::Value::Null)
    }
}

#[tokio::test]
async fn test_call_id_stack_grows_along_rpc_chain() {
    // Arrange
    let broker = Arc::new(InMemoryBroker::new());
    let sequence = Arc::new(CountingSequence::new());
    let seen = Seen::default();

    let mut child = ServiceContainer::builder("child", broker.clone())
        .sequence(sequence.clone())
        .rpc(
            "child_do",
            Arc::new(Hop {
                seen: seen.clone(),
                downstream: None,
            }),
        )
        .build()
        .unwrap();
    let mut parent = ServiceContainer::builder("parent", broker.clone())
        .sequence(sequence.clone())
        .rpc(
            "parent_do",
            Arc::new(Hop {
                seen: seen.clone(),
                downstream: Some((RpcProxy::new("child", broker.clone()), "child_do")),
            }),
        )
        .build()
        .unwrap();
    let grandparent = ServiceContainer::builder("grandparent", broker.clone())
        .sequence(sequence.clone())
        .rpc(
            "grandparent_do",
            Arc::new(Hop {
                seen: seen.clone(),
                downstream: Some((RpcProxy::new("parent", broker.clone()), "parent_do")),
            }),
        )
        .build()
        .unwrap();
    child.start().await.unwrap();
    parent.start().await.unwrap();

    // Act
    let result = grandparent
        .run_entrypoint("grandparent_do", json!([]), ContextData::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(
        result,
        json!([
            "grandparent.grandparent_do.0",
            "parent.parent_do.1",
            "child.child_do.2"
        ])
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("grandparent.grandparent_do.0".to_owned(), vec![]),
            (
                "parent.parent_do.1".to_owned(),
                vec!["grandparent.grandparent_do.0".to_owned()]
            ),
            (
                "child.child_do.2".to_owned(),
                vec![
                    "grandparent.grandparent_do.0".to_owned(),
                    "parent.parent_do.1".to_owned()
                ]
            ),
        ]
    );
    assert_eq!(sequence.call_count(), 3);

    parent.stop().await.unwrap();
    child.stop().await.unwrap();
}

#[tokio::test]
async fn test_parent_calls_tracked_truncates_inherited_stack() {
    let broker = Arc::new(InMemoryBroker::new());
    let container = ServiceContainer::builder("child", broker)
        .config(ContainerConfig::new().with(PARENT_CALLS_CONFIG_KEY, 2))
        .rpc(
            "child_do",
            Arc::new(Hop {
                seen: Seen::default(),
                downstream: None,
            }),
        )
        .build()
        .unwrap();
    let data = ContextData::from([(
        CALL_ID_STACK_HEADER.to_owned(),
        json!(["a.a.0", "b.b.1", "c.c.2", "d.d.3"]),
    )]);

    let result = container
        .run_entrypoint("child_do", json!([]), data)
        .await
        .unwrap();

    assert_eq!(result, json!(["c.c.2", "d.d.3", "child.child_do.0"]));
}

#[tokio::test]
async fn test_events_carry_call_id_stack_to_every_listening_service() {
    // Arrange
    let broker = Arc::new(InMemoryBroker::new());
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let sequence = Arc::new(CountingSequence::new());
    let mut listeners = Vec::new();
    for service in ["listener_one", "listener_two"] {
        let mut listener = ServiceContainer::builder(service, broker.clone())
            .sequence(sequence.clone())
            .event_handler(
                "handle_hello",
                EventHandlerConfig::new("event_raiser", "hello"),
                Arc::new(common::ChannelHandler::new(sender.clone())),
            )
            .build()
            .unwrap();
        listener.start().await.unwrap();
        listeners.push(listener);
    }
    let raiser = ServiceContainer::builder("event_raiser", broker.clone())
        .sequence(sequence.clone())
        .rpc(
            "say_hello",
            Arc::new(SayHello {
                dispatcher: EventDispatcher::new("event_raiser", broker.clone()),
            }),
        )
        .build()
        .unwrap();

    // Act
    raiser
        .run_entrypoint("say_hello", json!([]), ContextData::new())
        .await
        .unwrap();

    // Assert
    let mut handled = vec![
        common::next_handled(&mut receiver).await,
        common::next_handled(&mut receiver).await,
    ];
    handled.sort_by(|a, b| a.service.cmp(&b.service));
    assert_eq!(handled[0].service, "listener_one");
    assert_eq!(handled[1].service, "listener_two");
    for event in &handled {
        assert_eq!(event.parent_call_ids, vec!["event_raiser.say_hello.0"]);
        assert_eq!(event.payload, json!("hello"));
    }
    common::assert_quiet(&mut receiver).await;
    // One call id for the raiser and one per listening worker.
    assert_eq!(sequence.call_count(), 3);

    for listener in &mut listeners {
        listener.stop().await.unwrap();
    }
}
