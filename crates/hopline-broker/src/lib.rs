//! In-memory implementation of the Hopline transport.
//!
//! Provides topic exchanges, queues with ack/requeue, round-robin
//! consumers and auto-delete semantics, enough to run several service
//! containers against each other inside one process.

pub mod broker;
pub mod topic;

pub use broker::InMemoryBroker;
