//! Shared test helpers for container integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hopline_broker::InMemoryBroker;
use hopline_core::context::{Entrypoint, WorkerContext};
use hopline_core::dispatcher::EventDispatcher;
use hopline_core::error::HandlerError;
use hopline_core::event::EventKind;
use hopline_core::handler::EventHandler;
use hopline_test_support::StubContainer;
use tokio::sync::mpsc;

/// What a [`ChannelHandler`] saw for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub service: String,
    pub call_id: String,
    pub parent_call_ids: Vec<String>,
    pub payload: serde_json::Value,
    pub succeeded: bool,
}

/// Reports every invocation on a channel. The first `failures` invocations
/// fail.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Handled>,
    failures: usize,
    attempts: AtomicUsize,
    delay: Option<Duration>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::UnboundedSender<Handled>) -> Self {
        Self {
            sender,
            failures: 0,
            attempts: AtomicUsize::new(0),
            delay: None,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Highest number of invocations seen running at once.
    pub fn max_running(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_running)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(
        &self,
        context: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let succeeded = attempt >= self.failures;
        let _ = self.sender.send(Handled {
            service: context.service_name().to_owned(),
            call_id: context.call_id().to_string(),
            parent_call_ids: context.parent_call_ids().to_vec(),
            payload,
            succeeded,
        });
        if succeeded {
            Ok(())
        } else {
            Err(HandlerError::Failed(format!("attempt {attempt} failed")))
        }
    }
}

/// Publishes one `event_type` event from `source_service`.
pub async fn dispatch(
    broker: &Arc<InMemoryBroker>,
    source_service: &str,
    event_type: &str,
    payload: serde_json::Value,
) {
    let dispatcher = EventDispatcher::new(source_service, broker.clone());
    let container = StubContainer::new(source_service);
    let context = WorkerContext::builder(&container, &Entrypoint::new("emit")).build();
    let kind = EventKind::define("TestEvent", Some(event_type)).unwrap();
    dispatcher
        .dispatch(&context, &kind.event(payload))
        .await
        .unwrap();
}

/// Waits up to a second for the next handled event.
pub async fn next_handled(receiver: &mut mpsc::UnboundedReceiver<Handled>) -> Handled {
    tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}

/// Asserts nothing more is handled within a short grace period.
pub async fn assert_quiet(receiver: &mut mpsc::UnboundedReceiver<Handled>) {
    let extra = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await;
    assert!(
        !matches!(extra, Ok(Some(_))),
        "unexpected extra delivery: {extra:?}"
    );
}
