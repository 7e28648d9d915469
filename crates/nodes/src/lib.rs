//! Rig nodes: lifecycle, composable parts and the orchestrator
//!
//! A node is a [`Lifecycle`] implementation driven on its own thread through
//! `Created -> Connecting -> SyncWait -> Streaming -> Stopping -> CleanedUp`.
//! [`Producer`], [`Consumer`] and [`Pipeline`] compose the [`Outlet`] and
//! [`Inlet`] parts around a hardware collaborator or a transform. A
//! [`Rig`] builds nodes from a [`RigConfig`] through a [`NodeRegistry`].

pub mod builtin;
pub mod config;
pub mod consumer;
pub mod delay;
pub mod error;
pub mod interfaces;
pub mod lifecycle;
pub mod parts;
pub mod pipeline;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod rig;
pub mod sink;
pub mod state;

pub use config::{NodeSpec, RigConfig};
pub use consumer::{Consumer, Retention};
pub use delay::{delay_message, estimate_delay, DelayEstimator, DELAY_STREAM};
pub use error::{CollaboratorError, ConfigError, NodeError};
pub use interfaces::{Connectable, DevicePing, Publishable, SampleSink, SnapshotSource, Subscribable, Transform};
pub use lifecycle::{spawn_node, Lifecycle, NodeHandle, NodeSettings, NodeSummary, Step, StepContext};
pub use parts::{Inbound, Inlet, Outlet, StreamDecl};
pub use pipeline::Pipeline;
pub use producer::{AcquisitionMode, Producer};
pub use registry::{NodeFactory, NodeKind, NodeRegistry, Upstream};
pub use retry::{retry, RetryConfig, RetryOutcome, RetryPolicy};
pub use rig::Rig;
pub use sink::{drain_into, LiveView, MemorySink, SinkWorker, SourceBuffers, TracingSink};
pub use state::{NodeEvent, NodeReport, NodeState};
