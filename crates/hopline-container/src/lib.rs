//! Hopline service container.
//!
//! Hosts one service: binds its event handler registrations and RPC
//! entrypoints to the broker when started, runs every delivery in a
//! bounded worker pool with its own worker context, and releases the
//! subscriptions when stopped.

pub mod container;
pub mod error;
mod worker;

pub use container::{ContainerState, ServiceContainer, ServiceContainerBuilder};
pub use error::ContainerError;
