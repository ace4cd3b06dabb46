//! Call-id sequence abstraction for determinism.
//!
//! In production, a container owns one [`AtomicSequence`] for the life of
//! the process. In tests, a predictable implementation is injected.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of call-id sequence numbers.
pub trait SequenceSource: Send + Sync {
    /// Returns the next sequence number. Never returns the same value twice.
    fn next_sequence(&self) -> u64;
}

/// Production sequence backed by an atomic counter starting at zero.
#[derive(Debug, Default)]
pub struct AtomicSequence {
    next: AtomicU64,
}

impl AtomicSequence {
    /// Creates a sequence starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequence whose first value is `start`.
    #[must_use]
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl SequenceSource for AtomicSequence {
    fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
