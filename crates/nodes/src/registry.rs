//! Node factories resolved by kind at config-load time.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::builtin;
use crate::config::{NodeSpec, RigConfig};
use crate::error::{ConfigError, NodeError};
use crate::lifecycle::Lifecycle;
use crate::parts::StreamDecl;

/// Every node type a rig file can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    DummyProducer,
    DataLogger,
    DummyConsumer,
    LatencyProbe,
}

impl NodeKind {
    /// Whether nodes of this kind publish a data topic.
    pub fn publishes(self) -> bool {
        matches!(self, NodeKind::DummyProducer | NodeKind::LatencyProbe)
    }

    /// Whether nodes of this kind read upstream topics.
    pub fn subscribes(self) -> bool {
        matches!(self, NodeKind::DataLogger | NodeKind::DummyConsumer | NodeKind::LatencyProbe)
    }
}

/// Streams published by each upstream node, keyed by node name.
pub type Upstream = BTreeMap<String, Vec<StreamDecl>>;

/// Builds nodes of one kind.
pub trait NodeFactory: Send + Sync {
    /// Streams a node built from `spec` will publish.
    fn streams(&self, _spec: &NodeSpec) -> Result<Vec<StreamDecl>, NodeError> {
        Ok(vec![])
    }

    /// Creates the node. `upstream` holds the streams of every input.
    fn build(&self, spec: &NodeSpec, upstream: &Upstream) -> Result<Box<dyn Lifecycle>, NodeError>;
}

/// Factories by node kind. Constructed explicitly and passed by reference.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<NodeKind, Box<dyn NodeFactory>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a factory for every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtin_nodes(&mut registry);
        registry
    }

    /// Registers `factory` for `kind`, replacing any earlier one.
    pub fn register<F>(&mut self, kind: NodeKind, factory: F)
    where
        F: NodeFactory + 'static,
    {
        if self.factories.insert(kind, Box::new(factory)).is_some() {
            debug!(?kind, "Replaced node factory");
        }
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn factory(&self, kind: NodeKind) -> Result<&dyn NodeFactory, ConfigError> {
        self.factories
            .get(&kind)
            .map(|f| f.as_ref())
            .ok_or(ConfigError::UnregisteredKind(kind))
    }

    /// Validates `config` and builds every node, inputs before the nodes
    /// reading them.
    pub fn build_all(&self, config: &RigConfig) -> Result<Vec<Box<dyn Lifecycle>>, NodeError> {
        config.validate()?;
        let mut published: BTreeMap<String, Vec<StreamDecl>> = BTreeMap::new();
        let mut nodes = Vec::with_capacity(config.nodes.len());

        for spec in config.build_order()? {
            let factory = self.factory(spec.kind)?;
            let upstream: Upstream = spec
                .inputs
                .iter()
                .map(|input| (input.clone(), published.get(input).cloned().unwrap_or_default()))
                .collect();
            nodes.push(factory.build(spec, &upstream)?);
            if spec.kind.publishes() {
                published.insert(spec.name.clone(), factory.streams(spec)?);
            }
            debug!(node = %spec.name, kind = ?spec.kind, "Built node");
        }
        Ok(nodes)
    }
}
