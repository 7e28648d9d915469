//! Node kinds that ship with the rig.

pub mod consumers;
pub mod dummy;
pub mod latency;

pub use consumers::{DataLoggerFactory, DummyConsumerFactory};
pub use dummy::{DummyParams, DummyProducerFactory, DummySource};
pub use latency::{LatencyProbeFactory, LatencyTransform};

use crate::registry::{NodeKind, NodeRegistry};

/// Registers a factory for every built-in kind.
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    registry.register(NodeKind::DummyProducer, DummyProducerFactory);
    registry.register(NodeKind::DataLogger, DataLoggerFactory);
    registry.register(NodeKind::DummyConsumer, DummyConsumerFactory);
    registry.register(NodeKind::LatencyProbe, LatencyProbeFactory);
}
