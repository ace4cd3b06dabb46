//! Test sequence: predictable `SequenceSource` implementation for tests.

use std::sync::atomic::{AtomicU64, Ordering};

use hopline_core::sequence::SequenceSource;

/// A sequence that starts at zero and counts how many numbers were drawn.
#[derive(Debug, Default)]
pub struct CountingSequence {
    next: AtomicU64,
}

impl CountingSequence {
    /// Creates a sequence starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many sequence numbers have been drawn.
    pub fn call_count(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl SequenceSource for CountingSequence {
    fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
