use thiserror::Error;

/// Errors raised while encoding or decoding payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The serializer rejected the message.
    #[error("Encode error: {0}")]
    Encode(String),
    /// The payload bytes could not be decoded into a message.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Array metadata does not match its raw byte length.
    #[error("Shape {shape:?} with dtype {dtype} needs {expected} bytes, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        dtype: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The element count of a shape does not fit in memory.
    #[error("Shape {0:?} is too large")]
    ShapeOverflow(Vec<usize>),
    /// Array was requested as a different element type than it carries.
    #[error("Array holds {actual}, requested {requested}")]
    DtypeMismatch {
        actual: &'static str,
        requested: &'static str,
    },
    /// The message decoded, but its `data` field is not device -> stream -> sample.
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError::Decode(err.to_string())
    }
}
