//! Capabilities nodes are composed from
//!
//! Hardware collaborators implement [`Connectable`] and [`SnapshotSource`];
//! derived computations implement [`Transform`]; storage backends implement
//! [`SampleSink`]. Node types pick up [`Publishable`] / [`Subscribable`] by
//! owning an outlet or inlet part.

use rig_types::{Message, Sample, Snapshot};
use streams::{SchemaError, StreamBuffer};

use crate::error::{CollaboratorError, NodeError};

/// Something that must be brought up before use and released after.
pub trait Connectable: Send {
    /// One attempt at connecting. `false` means "not yet, try again".
    fn connect(&mut self) -> bool;

    /// Releases everything `connect` set up. Must be safe after a failed or
    /// partial `connect`, and idempotent.
    fn cleanup(&mut self);
}

/// A hardware collaborator producing snapshots.
pub trait SnapshotSource: Connectable {
    /// Declares every (device, stream) this source produces.
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError>;

    /// Pulls the next snapshot. `Ok(None)` means no data this tick.
    fn get_snapshot(&mut self) -> Result<Option<Snapshot>, CollaboratorError>;

    /// Stops sampling new data. Snapshots already captured may still be
    /// returned by `get_snapshot` until it yields `None`.
    fn stop_new_data(&mut self) {}

    /// Whether the source ran out of data on its own (e.g. a finished
    /// experiment protocol). Checked whenever `get_snapshot` yields `None`.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// A separate handle for timing round trips to the device while the
    /// source itself keeps acquiring. `None` when the device cannot be
    /// pinged.
    fn pinger(&self) -> Option<Box<dyn DevicePing>> {
        None
    }
}

/// Blocking round trip to a device, used to estimate transmission delay for
/// devices that cannot sync to the host clock.
pub trait DevicePing: Send {
    fn ping(&mut self) -> Result<(), CollaboratorError>;
}

/// A computation turning upstream messages into a derived snapshot.
pub trait Transform: Send {
    /// Declares every (device, stream) of the derived output.
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError>;

    /// Processes one message from `source`. `Ok(None)` publishes nothing.
    fn process(&mut self, source: &str, msg: &Message) -> Result<Option<Snapshot>, NodeError>;
}

/// Destination for drained samples (file writer, network uplink, ...).
pub trait SampleSink: Send {
    fn write(&mut self, source: &str, device: &str, stream: &str, samples: Vec<Sample>) -> Result<(), NodeError>;

    fn flush(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// A node that publishes on its own data topic.
pub trait Publishable {
    /// The node's data topic.
    fn topic(&self) -> String;
    /// Buffer holding what the node published.
    fn published(&self) -> &StreamBuffer;
}

/// A node that mirrors upstream topics.
pub trait Subscribable {
    /// Source tags this node listens to.
    fn sources(&self) -> Vec<String>;
    /// Mirrored buffer of one source.
    fn mirror(&self, source: &str) -> Option<&StreamBuffer>;
}
