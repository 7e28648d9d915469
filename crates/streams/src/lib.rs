//! Per-stream sample buffers shared between a node's threads
//!
//! A [`StreamBuffer`] maps device name -> stream name -> FIFO of samples plus
//! the stream's schema and an optional arrival-rate estimator. It is written
//! by one appending thread, drained by a logging thread and peeked by a
//! visualizer thread concurrently.

pub mod buffer;
pub mod error;
pub mod rate;
pub mod schema;

pub use buffer::{Drain, DrainMode, StreamBuffer};
pub use error::SchemaError;
pub use rate::RateEstimator;
pub use schema::{ColorFormat, StreamSchema};
