use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use flume::Sender;
use tracing::{debug, info, warn};

use crate::error::BusError;

/// Reply delivered to a participant waiting at the barrier.
pub type SyncReply = Result<(), BusError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Waiting,
    Released,
    TimedOut,
}

/// Startup barrier over a participant set known up front.
///
/// Every expected participant announces exactly once and is parked until
/// the last one arrives; the release then answers all of them in one step.
/// Unknown names, repeated announcements and announcements after release
/// are answered with an error right away and never count toward the set.
pub struct Barrier {
    expected: BTreeSet<String>,
    waiting: BTreeMap<String, Sender<SyncReply>>,
    state: BarrierState,
    /// How long the barrier waited and who was missing, once timed out.
    timed_out: Option<(Duration, Vec<String>)>,
}

impl Barrier {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut barrier = Self {
            expected: expected.into_iter().map(Into::into).collect(),
            waiting: BTreeMap::new(),
            state: BarrierState::Waiting,
            timed_out: None,
        };
        if barrier.expected.is_empty() {
            barrier.state = BarrierState::Released;
        }
        barrier
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    /// Expected participants that have not announced yet.
    pub fn pending(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|name| !self.waiting.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Registers `participant`. Returns `true` when this announcement
    /// completed the set and released everyone.
    pub fn announce(&mut self, participant: &str, reply: Sender<SyncReply>) -> bool {
        let rejection = match self.state {
            BarrierState::Released => Some(BusError::AlreadyReleased(participant.to_string())),
            BarrierState::TimedOut => {
                let (waited, pending) = self.timed_out.clone().unwrap_or_default();
                Some(BusError::BarrierTimeout(waited, pending))
            }
            BarrierState::Waiting if !self.expected.contains(participant) => {
                Some(BusError::UnexpectedParticipant(participant.to_string()))
            }
            BarrierState::Waiting if self.waiting.contains_key(participant) => {
                Some(BusError::DuplicateParticipant(participant.to_string()))
            }
            BarrierState::Waiting => None,
        };
        if let Some(err) = rejection {
            warn!(participant, error = %err, "Rejected barrier announcement");
            let _ = reply.send(Err(err));
            return false;
        }

        self.waiting.insert(participant.to_string(), reply);
        debug!(
            participant,
            arrived = self.waiting.len(),
            expected = self.expected.len(),
            "Participant announced"
        );
        if self.waiting.len() < self.expected.len() {
            return false;
        }

        self.state = BarrierState::Released;
        info!(participants = self.waiting.len(), "Barrier released");
        for (name, reply) in std::mem::take(&mut self.waiting) {
            if reply.send(Ok(())).is_err() {
                warn!(participant = %name, "Participant left before the barrier released");
            }
        }
        true
    }

    /// Gives up on the barrier; everyone parked is told the wait timed out.
    pub fn time_out(&mut self, waited: Duration) {
        if self.state != BarrierState::Waiting {
            return;
        }
        let pending = self.pending();
        warn!(?pending, "Barrier timed out");
        self.state = BarrierState::TimedOut;
        for (_, reply) in std::mem::take(&mut self.waiting) {
            let _ = reply.send(Err(BusError::BarrierTimeout(waited, pending.clone())));
        }
        self.timed_out = Some((waited, pending));
    }
}
