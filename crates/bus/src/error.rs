use std::time::Duration;

use rig_types::CodecError;
use thiserror::Error;

/// Errors surfaced by the messaging fabric.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Broker is shut down")]
    Disconnected,

    #[error("Participant '{0}' is not expected at the barrier")]
    UnexpectedParticipant(String),

    #[error("Participant '{0}' announced twice")]
    DuplicateParticipant(String),

    #[error("Barrier already released; '{0}' is too late")]
    AlreadyReleased(String),

    #[error("Barrier timed out after {0:?} waiting for {1:?}")]
    BarrierTimeout(Duration, Vec<String>),

    #[error("Kill received while waiting")]
    Killed,

    #[error("Failed to spawn broker thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
