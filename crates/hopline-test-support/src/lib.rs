//! Shared test mocks and utilities for Hopline.

mod container;
mod sequence;
mod transport;

pub use container::StubContainer;
pub use sequence::CountingSequence;
pub use transport::{FailingTransport, Published, RecordingTransport};
