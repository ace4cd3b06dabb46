//! Worker context.
//!
//! A worker context is created for every entrypoint invocation. It
//! computes the invocation's call id, extends the call-id stack inherited
//! through the per-call `data`, and provides the headers any outgoing RPC
//! call or event dispatch must carry so the next hop can continue the
//! trail.

use std::sync::Arc;

use crate::call_id::{CallId, CallIdStack};
use crate::config::ContainerConfig;
use crate::message::{CALL_ID_STACK_HEADER, ContextData, Headers};
use crate::sequence::SequenceSource;

/// The parts of a service container a worker context depends on.
pub trait ContainerContext: Send + Sync {
    /// Name of the service hosted by the container.
    fn service_name(&self) -> &str;

    /// The container's configuration.
    fn config(&self) -> &ContainerConfig;

    /// The container's call-id sequence.
    fn sequence(&self) -> &dyn SequenceSource;

    /// Cap on inherited call ids, `None` for unlimited.
    ///
    /// Containers validate their configuration up front and usually
    /// override this with the cached value. The default re-reads the
    /// configuration and treats an invalid value as unlimited.
    fn max_parent_calls(&self) -> Option<usize> {
        self.config().parent_calls_tracked().ok().flatten()
    }
}

/// Metadata about the entrypoint being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entrypoint {
    /// Entrypoint (method) name.
    pub name: String,
}

impl Entrypoint {
    /// Creates entrypoint metadata for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Per-invocation context carrying the call-id stack.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    service_name: String,
    entrypoint: Entrypoint,
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
    data: ContextData,
    call_id: CallId,
    call_id_stack: CallIdStack,
    immediate_parent_call_id: Option<String>,
}

impl WorkerContext {
    /// Starts building a context for `entrypoint` inside `container`.
    #[must_use]
    pub fn builder<'a>(
        container: &'a dyn ContainerContext,
        entrypoint: &Entrypoint,
    ) -> WorkerContextBuilder<'a> {
        WorkerContextBuilder {
            container,
            entrypoint: entrypoint.clone(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            data: None,
        }
    }

    /// Name of the service the worker runs in.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The entrypoint being invoked.
    #[must_use]
    pub fn entrypoint(&self) -> &Entrypoint {
        &self.entrypoint
    }

    /// Positional arguments of the invocation.
    #[must_use]
    pub fn args(&self) -> &[serde_json::Value] {
        &self.args
    }

    /// Keyword arguments of the invocation.
    #[must_use]
    pub fn kwargs(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.kwargs
    }

    /// Per-call data the context was built from.
    #[must_use]
    pub fn data(&self) -> &ContextData {
        &self.data
    }

    /// This invocation's call id.
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// The call-id stack, ending with this invocation's call id.
    #[must_use]
    pub fn call_id_stack(&self) -> &CallIdStack {
        &self.call_id_stack
    }

    /// The call ids inherited from ancestors, after any truncation.
    #[must_use]
    pub fn parent_call_ids(&self) -> &[String] {
        let ids = self.call_id_stack.as_slice();
        &ids[..ids.len() - 1]
    }

    /// Last call id of the stack as it was passed in, if any.
    #[must_use]
    pub fn immediate_parent_call_id(&self) -> Option<&str> {
        self.immediate_parent_call_id.as_deref()
    }

    /// Headers an outgoing call or event made by this worker must carry.
    #[must_use]
    pub fn outgoing_headers(&self) -> Headers {
        Headers::from([(
            CALL_ID_STACK_HEADER.to_owned(),
            serde_json::Value::from(self.call_id_stack.to_vec()),
        )])
    }
}

/// Builder for [`WorkerContext`].
pub struct WorkerContextBuilder<'a> {
    container: &'a dyn ContainerContext,
    entrypoint: Entrypoint,
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
    data: Option<ContextData>,
}

impl WorkerContextBuilder<'_> {
    /// Sets the positional arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets the keyword arguments.
    #[must_use]
    pub fn kwargs(mut self, kwargs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Sets the per-call data, usually the incoming message headers.
    #[must_use]
    pub fn data(mut self, data: ContextData) -> Self {
        self.data = Some(data);
        self
    }

    /// Allocates a call id and builds the context.
    #[must_use]
    pub fn build(self) -> WorkerContext {
        let data = self.data.unwrap_or_default();
        let inherited = inherited_stack(&data);
        let service_name = self.container.service_name().to_owned();
        let call_id = CallId::new(
            &service_name,
            &self.entrypoint.name,
            self.container.sequence().next_sequence(),
        );
        let call_id_stack =
            CallIdStack::extend(&inherited, self.container.max_parent_calls(), &call_id);
        let immediate_parent_call_id = inherited.last().cloned();

        tracing::debug!(
            call_id = %call_id,
            depth = call_id_stack.len(),
            "worker context created"
        );

        WorkerContext {
            service_name,
            entrypoint: self.entrypoint,
            args: self.args,
            kwargs: self.kwargs,
            data,
            call_id,
            call_id_stack,
            immediate_parent_call_id,
        }
    }
}

fn inherited_stack(data: &ContextData) -> Vec<String> {
    let Some(value) = data.get(CALL_ID_STACK_HEADER) else {
        return Vec::new();
    };
    if value.is_null() {
        return Vec::new();
    }
    match serde_json::from_value::<Vec<String>>(value.clone()) {
        Ok(stack) => stack,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed call id stack");
            Vec::new()
        }
    }
}

/// A shared container handle usable as a [`ContainerContext`].
impl<T: ContainerContext + ?Sized> ContainerContext for Arc<T> {
    fn service_name(&self) -> &str {
        (**self).service_name()
    }

    fn config(&self) -> &ContainerConfig {
        (**self).config()
    }

    fn sequence(&self) -> &dyn SequenceSource {
        (**self).sequence()
    }

    fn max_parent_calls(&self) -> Option<usize> {
        (**self).max_parent_calls()
    }
}
