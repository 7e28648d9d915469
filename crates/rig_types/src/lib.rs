//! Shared types for the acquisition bus
//!
//! This crate contains the wire-level data model every node speaks: sample
//! values (including n-dimensional numeric arrays), snapshots pulled from
//! hardware collaborators, the named-field message that travels on a topic,
//! and the two-part frame/envelope codec used by the messaging fabric.

pub mod data;
pub mod comms;
pub mod codec;
pub mod error;

// Re-export commonly used types
pub use data::*;
pub use comms::*;
pub use codec::*;
pub use error::*;
