use std::thread;
use std::time::Duration;

use flume::Selector;
use rig_types::Frame;

use crate::kill::KillSocket;
use crate::socket::SubSocket;

/// Outcome of one bounded poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Frame(Frame),
    Kill,
    Timeout,
    /// The subscription lost its broker.
    Disconnected,
}

/// Bounded wait over a node's subscription and kill sockets.
///
/// Either socket may be left out; a node stops listening for the kill once
/// it has started stopping, and producers have no subscription.
#[derive(Default)]
pub struct Poller<'a> {
    sub: Option<&'a SubSocket>,
    kill: Option<&'a KillSocket>,
}

impl<'a> Poller<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sub(mut self, sub: &'a SubSocket) -> Self {
        self.sub = Some(sub);
        self
    }

    pub fn with_kill(mut self, kill: &'a KillSocket) -> Self {
        self.kill = Some(kill);
        self
    }

    pub fn poll(&self, timeout: Duration) -> PollEvent {
        if self.sub.is_none() && self.kill.is_none() {
            thread::sleep(timeout);
            return PollEvent::Timeout;
        }
        let mut selector = Selector::new();
        if let Some(sub) = self.sub {
            selector = selector.recv(&sub.rx, |r| r.map_or(PollEvent::Disconnected, PollEvent::Frame));
        }
        if let Some(kill) = self.kill {
            // A vanished broker is as final as a kill.
            selector = selector.recv(&kill.rx, |_| PollEvent::Kill);
        }
        selector.wait_timeout(timeout).unwrap_or(PollEvent::Timeout)
    }
}
