//! Container error types.

use hopline_core::error::{ConfigurationError, HandlerError, TransportError};
use thiserror::Error;

/// Errors raised while building, starting, stopping or invoking a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The service is misconfigured and cannot run.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The broker rejected a declaration, subscription or cancellation.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Two entrypoints share a name.
    #[error("duplicate entrypoint {0}")]
    DuplicateEntrypoint(String),

    /// No RPC entrypoint has this name.
    #[error("unknown entrypoint {0}")]
    UnknownEntrypoint(String),

    /// `start` was called on a container that is running or stopped.
    #[error("container for {0} already started")]
    AlreadyStarted(String),

    /// `stop` was called on a container that is not running.
    #[error("container for {0} is not running")]
    NotRunning(String),

    /// A directly invoked entrypoint failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}
