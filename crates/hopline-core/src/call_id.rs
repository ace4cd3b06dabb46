//! Call ids and the call-id stack.
//!
//! A call id names one worker invocation as
//! `{service_name}.{entrypoint_name}.{sequence}`. The call-id stack is the
//! ordered trail of call ids from the root of a request tree down to the
//! current invocation, whose own id is always last.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a single worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Formats a call id from its parts.
    #[must_use]
    pub fn new(service_name: &str, entrypoint_name: &str, sequence: u64) -> Self {
        Self(format!("{service_name}.{entrypoint_name}.{sequence}"))
    }

    /// Returns the call id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, immutable trail of causally related call ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallIdStack(Vec<String>);

impl CallIdStack {
    /// Builds a stack from an inherited trail and the current call id.
    ///
    /// When `max_parent_calls` is set and `inherited` is longer, only the
    /// most recent `max_parent_calls` entries are kept before `call_id` is
    /// appended, so the result holds at most `max_parent_calls + 1` ids.
    #[must_use]
    pub fn extend(inherited: &[String], max_parent_calls: Option<usize>, call_id: &CallId) -> Self {
        let kept = match max_parent_calls {
            Some(cap) if inherited.len() > cap => &inherited[inherited.len() - cap..],
            _ => inherited,
        };
        let mut ids = Vec::with_capacity(kept.len() + 1);
        ids.extend_from_slice(kept);
        ids.push(call_id.as_str().to_owned());
        Self(ids)
    }

    /// Returns the ids, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Returns the most recent id.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Returns the number of ids on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the stack holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an owned copy of the ids, for propagation.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl PartialEq<Vec<&str>> for CallIdStack {
    fn eq(&self, other: &Vec<&str>) -> bool {
        self.0.len() == other.len() && self.0.iter().zip(other).all(|(a, b)| a == b)
    }
}
