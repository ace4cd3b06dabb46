//! Service container.

use std::collections::HashMap;
use std::sync::Arc;

use hopline_core::config::ContainerConfig;
use hopline_core::context::{ContainerContext, Entrypoint, WorkerContext};
use hopline_core::dispatcher::EventDispatcher;
use hopline_core::error::ConfigurationError;
use hopline_core::handler::{EventHandler, EventHandlerConfig, HandlerRegistration};
use hopline_core::message::ContextData;
use hopline_core::rpc::{RpcHandler, RpcProxy, rpc_queue};
use hopline_core::sequence::{AtomicSequence, SequenceSource};
use hopline_core::transport::Transport;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::ContainerError;
use crate::worker::{self, EventBinding};

/// Lifecycle of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Built, nothing bound yet.
    Created,
    /// Queues bound and consumed.
    Running,
    /// Subscriptions released.
    Stopped,
}

/// The parts of a container shared with its worker tasks.
pub(crate) struct Host {
    pub(crate) service_name: String,
    pub(crate) config: ContainerConfig,
    pub(crate) max_parent_calls: Option<usize>,
    pub(crate) sequence: Arc<dyn SequenceSource>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) max_workers: u32,
    pub(crate) rpc_handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl ContainerContext for Host {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn sequence(&self) -> &dyn SequenceSource {
        self.sequence.as_ref()
    }

    fn max_parent_calls(&self) -> Option<usize> {
        self.max_parent_calls
    }
}

struct EventEntrypoint {
    entrypoint: Entrypoint,
    registration: HandlerRegistration,
    handler: Arc<dyn EventHandler>,
}

/// Builder for [`ServiceContainer`].
pub struct ServiceContainerBuilder {
    service_name: String,
    transport: Arc<dyn Transport>,
    config: ContainerConfig,
    sequence: Option<Arc<dyn SequenceSource>>,
    event_handlers: Vec<(String, EventHandlerConfig, Arc<dyn EventHandler>)>,
    rpc_handlers: Vec<(String, Arc<dyn RpcHandler>)>,
}

impl ServiceContainerBuilder {
    /// Sets the container configuration.
    #[must_use]
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Injects the call-id sequence. Defaults to a fresh [`AtomicSequence`].
    #[must_use]
    pub fn sequence(mut self, sequence: Arc<dyn SequenceSource>) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Adds an event handling entrypoint named `entrypoint`.
    #[must_use]
    pub fn event_handler(
        mut self,
        entrypoint: &str,
        config: EventHandlerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.event_handlers
            .push((entrypoint.to_owned(), config, handler));
        self
    }

    /// Adds an RPC entrypoint named `entrypoint`.
    #[must_use]
    pub fn rpc(mut self, entrypoint: &str, handler: Arc<dyn RpcHandler>) -> Self {
        self.rpc_handlers.push((entrypoint.to_owned(), handler));
        self
    }

    /// Validates configuration and handler registrations.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Configuration` for invalid configuration
    /// values or handler registrations (e.g. broadcast with reliable
    /// delivery), and `ContainerError::DuplicateEntrypoint` when two
    /// entrypoints share a name.
    pub fn build(self) -> Result<ServiceContainer, ContainerError> {
        let max_parent_calls = self.config.parent_calls_tracked()?;
        let pool_size = self.config.max_workers()?;
        let max_workers =
            u32::try_from(pool_size).map_err(|e| ConfigurationError::InvalidValue {
                key: hopline_core::config::MAX_WORKERS_CONFIG_KEY.to_owned(),
                reason: e.to_string(),
            })?;

        let mut names: Vec<&str> = Vec::new();
        let entrypoint_names = self
            .event_handlers
            .iter()
            .map(|(name, _, _)| name.as_str())
            .chain(self.rpc_handlers.iter().map(|(name, _)| name.as_str()));
        for name in entrypoint_names {
            if names.contains(&name) {
                return Err(ContainerError::DuplicateEntrypoint(name.to_owned()));
            }
            names.push(name);
        }

        let events = self
            .event_handlers
            .into_iter()
            .map(|(name, config, handler)| {
                config.register().map(|registration| EventEntrypoint {
                    entrypoint: Entrypoint::new(name),
                    registration,
                    handler,
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let host = Host {
            service_name: self.service_name,
            config: self.config,
            max_parent_calls,
            sequence: self
                .sequence
                .unwrap_or_else(|| Arc::new(AtomicSequence::new())),
            transport: self.transport,
            workers: Arc::new(Semaphore::new(pool_size)),
            max_workers,
            rpc_handlers: self.rpc_handlers.into_iter().collect(),
        };

        Ok(ServiceContainer {
            host: Arc::new(host),
            events,
            state: ContainerState::Created,
            consumer_tags: Vec::new(),
            tasks: Vec::new(),
        })
    }
}

/// Hosts one service's entrypoints.
pub struct ServiceContainer {
    host: Arc<Host>,
    events: Vec<EventEntrypoint>,
    state: ContainerState,
    consumer_tags: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceContainer {
    /// Starts building a container for `service_name` talking to `transport`.
    #[must_use]
    pub fn builder(service_name: &str, transport: Arc<dyn Transport>) -> ServiceContainerBuilder {
        ServiceContainerBuilder {
            service_name: service_name.to_owned(),
            transport,
            config: ContainerConfig::new(),
            sequence: None,
            event_handlers: Vec::new(),
            rpc_handlers: Vec::new(),
        }
    }

    /// Name of the hosted service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.host.service_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// The container's event handler registrations.
    pub fn event_registrations(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.events.iter().map(|e| &e.registration)
    }

    /// A dispatcher publishing this service's events.
    #[must_use]
    pub fn event_dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.host.service_name.clone(), Arc::clone(&self.host.transport))
    }

    /// A proxy for calling `target_service`.
    #[must_use]
    pub fn rpc_proxy(&self, target_service: &str) -> RpcProxy {
        RpcProxy::new(target_service, Arc::clone(&self.host.transport))
    }

    /// Builds a worker context for `entrypoint` in this container.
    #[must_use]
    pub fn worker_context(&self, entrypoint: &str, data: ContextData) -> WorkerContext {
        WorkerContext::builder(self.host.as_ref(), &Entrypoint::new(entrypoint))
            .data(data)
            .build()
    }

    /// Declares and binds every queue and starts consuming.
    ///
    /// If any declaration or subscription fails, the consumers acquired so
    /// far are cancelled and the container stays `Created`, so `start` can
    /// be retried.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::AlreadyStarted` unless the container was just
    /// built, and `ContainerError::Transport` if the broker rejects a
    /// declaration or subscription.
    pub async fn start(&mut self) -> Result<(), ContainerError> {
        if self.state != ContainerState::Created {
            return Err(ContainerError::AlreadyStarted(self.host.service_name.clone()));
        }
        let bound: Vec<HandlerRegistration> =
            self.events.iter().map(|e| e.registration.clone()).collect();

        if let Err(e) = self.bind().await {
            tracing::warn!(
                error = %e,
                service = %self.host.service_name,
                "container failed to start, releasing consumers"
            );
            self.release().await;
            for (event, registration) in self.events.iter_mut().zip(bound) {
                event.registration = registration;
            }
            return Err(e);
        }

        self.state = ContainerState::Running;
        tracing::info!(service = %self.host.service_name, "container started");
        Ok(())
    }

    async fn bind(&mut self) -> Result<(), ContainerError> {
        let transport = Arc::clone(&self.host.transport);

        for event in &mut self.events {
            let queue = event.registration.queue_for(&self.host.service_name)?;
            transport.declare_queue(&queue).await?;
            let subscription = transport.consume(&queue.name).await?;
            self.consumer_tags.push(subscription.consumer_tag.clone());
            tracing::info!(
                queue = %queue.name,
                routing_key = %queue.routing_key,
                exchange = %queue.exchange.name,
                "event handler bound"
            );
            event
                .registration
                .mark_consuming(queue, subscription.consumer_tag.clone())?;

            let binding = EventBinding {
                entrypoint: event.entrypoint.clone(),
                registration: Arc::new(event.registration.clone()),
                handler: Arc::clone(&event.handler),
            };
            self.tasks.push(tokio::spawn(
                worker::consume_events(Arc::clone(&self.host), binding, subscription)
                    .instrument(tracing::info_span!("consumer", service = %self.host.service_name)),
            ));
        }

        if !self.host.rpc_handlers.is_empty() {
            let queue = rpc_queue(&self.host.service_name);
            transport.declare_queue(&queue).await?;
            let subscription = transport.consume(&queue.name).await?;
            self.consumer_tags.push(subscription.consumer_tag.clone());
            tracing::info!(queue = %queue.name, "rpc entrypoints bound");
            self.tasks.push(tokio::spawn(
                worker::consume_rpc(Arc::clone(&self.host), subscription)
                    .instrument(tracing::info_span!("consumer", service = %self.host.service_name)),
            ));
        }
        Ok(())
    }

    /// Cancels every subscription and waits for running workers to finish.
    ///
    /// Cancellation failures are logged; the container still stops.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::NotRunning` unless the container is running.
    pub async fn stop(&mut self) -> Result<(), ContainerError> {
        if self.state != ContainerState::Running {
            return Err(ContainerError::NotRunning(self.host.service_name.clone()));
        }
        for event in &mut self.events {
            event.registration.mark_stopped();
        }
        self.release().await;
        // Every permit back means no worker is running.
        match self.host.workers.acquire_many(self.host.max_workers).await {
            Ok(permits) => drop(permits),
            Err(e) => tracing::warn!(error = %e, "worker pool closed"),
        }

        self.state = ContainerState::Stopped;
        tracing::info!(service = %self.host.service_name, "container stopped");
        Ok(())
    }

    /// Cancels the acquired consumers and waits for their loops to drain.
    async fn release(&mut self) {
        for tag in self.consumer_tags.drain(..) {
            if let Err(e) = self.host.transport.cancel(&tag).await {
                tracing::warn!(error = %e, consumer_tag = %tag, "failed to cancel consumer");
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "consumer task ended abnormally");
            }
        }
    }

    /// Invokes RPC entrypoint `name` directly with `args`, bypassing the broker.
    ///
    /// `data` seeds the worker context, e.g. with an inherited call-id stack.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::UnknownEntrypoint` if no RPC entrypoint has
    /// that name and `ContainerError::Handler` if the entrypoint fails.
    pub async fn run_entrypoint(
        &self,
        name: &str,
        args: serde_json::Value,
        data: ContextData,
    ) -> Result<serde_json::Value, ContainerError> {
        let handler = self
            .host
            .rpc_handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownEntrypoint(name.to_owned()))?;
        Ok(worker::run_rpc(&self.host, handler.as_ref(), name, args, data).await?)
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("service_name", &self.host.service_name)
            .field("state", &self.state)
            .field("event_registrations", &self.events.len())
            .field("rpc_entrypoints", &self.host.rpc_handlers.len())
            .finish_non_exhaustive()
    }
}
