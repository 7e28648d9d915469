//! Error types for nodes and rig configuration

use bus::BusError;
use rig_types::CodecError;
use streams::SchemaError;
use thiserror::Error;

/// Failure reported by a hardware collaborator while acquiring.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    /// The device is gone; the node goes back through the connect retry.
    #[error("device disconnected: {0}")]
    Disconnected(String),
    /// A hiccup the device recovers from on its own; the tick is skipped.
    #[error("transient device error: {0}")]
    Transient(String),
}

/// Errors raised while running a node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Node '{0}' is not attached to the fabric")]
    NotAttached(String),

    #[error("Panicked: {0}")]
    Panicked(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),
}

impl NodeError {
    /// Errors after which the node must not keep streaming.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Schema(_) | NodeError::NotAttached(_))
    }
}

/// Errors found while loading or validating a rig configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Rig has no nodes")]
    Empty,

    #[error("Node name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("Node name '{0}' is not a valid topic prefix")]
    InvalidName(String),

    #[error("Node '{node}' reads from unknown node '{input}'")]
    UnknownInput { node: String, input: String },

    #[error("Node '{node}' reads from '{input}', which publishes nothing")]
    NotAPublisher { node: String, input: String },

    #[error("Node inputs form a cycle through '{0}'")]
    Cycle(String),

    #[error("Node '{0}' subscribes but lists no inputs")]
    MissingInputs(String),

    #[error("Node '{0}' does not subscribe but lists inputs")]
    UnexpectedInputs(String),

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("Invalid params for node '{node}': {message}")]
    BadParams { node: String, message: String },

    #[error("No factory registered for node kind {0:?}")]
    UnregisteredKind(crate::registry::NodeKind),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}
