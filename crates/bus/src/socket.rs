use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Selector, Sender};
use rig_types::{Frame, Message};
use tracing::{debug, trace};

use crate::barrier::SyncReply;
use crate::error::BusError;
use crate::kill::KillSocket;

/// Writes frames into the broker's backend.
#[derive(Clone)]
pub struct PubSocket {
    pub(crate) tx: Sender<Frame>,
}

impl PubSocket {
    pub fn send(&self, frame: Frame) -> Result<(), BusError> {
        trace!(topic = %frame.topic, bytes = frame.payload.len(), "Publishing frame");
        self.tx.send(frame).map_err(|_| BusError::Disconnected)
    }

    /// Serializes `msg` and publishes it on `tag`'s data topic.
    pub fn publish(&self, tag: &str, msg: &Message) -> Result<(), BusError> {
        self.send(Frame::data(tag, msg)?)
    }

    /// Publishes the END sentinel on `tag`'s data topic.
    pub fn end(&self, tag: &str) -> Result<(), BusError> {
        debug!(node = %tag, "Publishing END");
        self.send(Frame::end(tag))
    }
}

/// Registration of one subscriber with the forwarder.
pub(crate) struct Subscription {
    pub(crate) name: String,
    pub(crate) filters: Arc<RwLock<Vec<String>>>,
    pub(crate) tx: Sender<Frame>,
}

impl Subscription {
    pub(crate) fn wants(&self, topic: &str) -> bool {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|prefix| topic.starts_with(prefix.as_str()))
    }
}

/// Receives frames relayed by the forwarder whose topic starts with one of
/// the subscribed prefixes. Dropping the socket unregisters it.
pub struct SubSocket {
    pub(crate) name: String,
    pub(crate) rx: Receiver<Frame>,
    pub(crate) filters: Arc<RwLock<Vec<String>>>,
}

impl SubSocket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a topic prefix. The empty prefix matches everything.
    pub fn subscribe(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        debug!(subscriber = %self.name, %prefix, "Subscribing");
        let mut filters = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        if !filters.contains(&prefix) {
            filters.push(prefix);
        }
    }

    pub fn unsubscribe(&self, prefix: &str) {
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p != prefix);
    }

    /// Waits up to `timeout` for the next frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// Request sent to the broker's sync service.
pub(crate) struct SyncRequest {
    pub(crate) participant: String,
    pub(crate) reply: Sender<SyncReply>,
}

/// Request/acknowledge endpoint of the startup barrier.
#[derive(Clone)]
pub struct SyncSocket {
    pub(crate) tx: Sender<SyncRequest>,
}

enum SyncWait {
    Reply(SyncReply),
    Killed,
    Lost,
}

impl SyncSocket {
    /// Announces `participant` and blocks until the barrier releases.
    ///
    /// Returns early with [`BusError::Killed`] if `kill` fires first, and
    /// with [`BusError::BarrierTimeout`] if `timeout` elapses.
    pub fn announce(
        &self,
        participant: &str,
        kill: Option<&KillSocket>,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send(SyncRequest {
                participant: participant.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| BusError::Disconnected)?;
        debug!(node = %participant, "Waiting at barrier");

        let started = Instant::now();
        let mut selector = Selector::new().recv(&reply_rx, |r| match r {
            Ok(reply) => SyncWait::Reply(reply),
            Err(_) => SyncWait::Lost,
        });
        if let Some(kill) = kill {
            selector = selector.recv(&kill.rx, |_| SyncWait::Killed);
        }
        let outcome = match timeout {
            Some(t) => selector.wait_timeout(t).ok(),
            None => Some(selector.wait()),
        };

        match outcome {
            Some(SyncWait::Reply(reply)) => reply,
            Some(SyncWait::Killed) => Err(BusError::Killed),
            Some(SyncWait::Lost) => Err(BusError::Disconnected),
            None => Err(BusError::BarrierTimeout(started.elapsed(), vec![participant.to_string()])),
        }
    }
}
