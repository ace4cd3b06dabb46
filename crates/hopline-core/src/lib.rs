//! Hopline Core: call-id tracking and event dispatch abstractions.
//!
//! This crate defines the traits and types shared by every Hopline
//! service: events and their exchanges, handler registrations, the
//! worker context that carries the call-id stack, and the transport
//! port the broker implements. It contains no infrastructure code.

pub mod call_id;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod rpc;
pub mod sequence;
pub mod transport;
