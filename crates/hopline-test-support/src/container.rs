//! Test container: minimal `ContainerContext` implementation for tests.

use hopline_core::config::ContainerConfig;
use hopline_core::context::ContainerContext;
use hopline_core::sequence::SequenceSource;

use crate::sequence::CountingSequence;

/// A container that only knows its name, configuration and sequence.
#[derive(Debug)]
pub struct StubContainer {
    service_name: String,
    config: ContainerConfig,
    sequence: CountingSequence,
}

impl StubContainer {
    /// Creates a stub container for `service_name` with an empty configuration.
    #[must_use]
    pub fn new(service_name: &str) -> Self {
        Self::with_config(service_name, ContainerConfig::new())
    }

    /// Creates a stub container for `service_name` with `config`.
    #[must_use]
    pub fn with_config(service_name: &str, config: ContainerConfig) -> Self {
        Self {
            service_name: service_name.to_owned(),
            config,
            sequence: CountingSequence::new(),
        }
    }

    /// The container's predictable sequence.
    pub fn counting_sequence(&self) -> &CountingSequence {
        &self.sequence
    }
}

impl ContainerContext for StubContainer {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn sequence(&self) -> &dyn SequenceSource {
        &self.sequence
    }
}
