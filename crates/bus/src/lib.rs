//! In-process messaging fabric for rig nodes
//!
//! The [`Broker`] owns the shared endpoints: a backend that every publisher
//! writes frames into, a forwarder that relays those frames verbatim to
//! topic-prefix subscribers, a sync service implementing the startup
//! barrier and a kill broadcast. Nodes reach the broker through a cloneable
//! [`Fabric`] handle and own the sockets it hands out.

pub mod barrier;
pub mod broker;
pub mod error;
pub mod kill;
pub mod poller;
pub mod socket;

pub use barrier::{Barrier, BarrierState};
pub use broker::{Broker, BrokerConfig, Fabric};
pub use error::BusError;
pub use kill::{KillHub, KillRequester, KillSocket};
pub use poller::{PollEvent, Poller};
pub use socket::{PubSocket, SubSocket, SyncSocket};
