use thiserror::Error;

/// Errors raised by stream buffer operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("Unknown stream: {device}/{stream}")]
    UnknownStream { device: String, stream: String },

    #[error("Invalid schema for {device}/{stream}: {message}")]
    InvalidSchema {
        device: String,
        stream: String,
        message: String,
    },

    #[error("Stream {device}/{stream} is already declared with a different schema")]
    Conflict { device: String, stream: String },
}
