//! Messages exchanged through the broker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header carrying the call-id stack of the sending worker.
pub const CALL_ID_STACK_HEADER: &str = "call_id_stack";

/// Header naming the routing key an RPC reply must be published with.
pub const REPLY_TO_HEADER: &str = "reply_to";

/// Header matching an RPC reply to its request.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// Per-call data handed to a worker context, populated from incoming headers.
pub type ContextData = HashMap<String, serde_json::Value>;

/// Message headers.
pub type Headers = HashMap<String, serde_json::Value>;

/// A message moving through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Serialized body.
    pub payload: serde_json::Value,
    /// Metadata travelling with the body.
    pub headers: Headers,
}

impl Message {
    /// Creates a message with no headers.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            headers: Headers::new(),
        }
    }

    /// Adds `headers`, replacing any existing values under the same keys.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Adds a single header.
    #[must_use]
    pub fn with_header(mut self, key: &str, value: serde_json::Value) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Returns a string header, if present and a string.
    #[must_use]
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(serde_json::Value::as_str)
    }

    /// Returns the headers as worker context data.
    #[must_use]
    pub fn context_data(&self) -> ContextData {
        self.headers.clone()
    }
}
