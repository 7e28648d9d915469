use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Selector, Sender};
use rig_types::Frame;
use tracing::{debug, error, info, warn};

use crate::barrier::{Barrier, BarrierState};
use crate::error::BusError;
use crate::kill::{KillHub, KillRequester, KillSocket};
use crate::socket::{PubSocket, SubSocket, Subscription, SyncRequest, SyncSocket};

/// Broker settings.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Source tags of every node that must announce before anyone streams.
    pub participants: Vec<String>,
    /// Give up on the barrier after this long. `None` waits forever.
    pub barrier_timeout: Option<Duration>,
}

type Subscribers = Arc<RwLock<Vec<Subscription>>>;

/// Cloneable handle through which nodes obtain their sockets.
#[derive(Clone)]
pub struct Fabric {
    backend_tx: Sender<Frame>,
    subscribers: Subscribers,
    sync_tx: Sender<SyncRequest>,
    kill: Arc<KillHub>,
}

impl Fabric {
    pub fn publisher(&self) -> PubSocket {
        PubSocket {
            tx: self.backend_tx.clone(),
        }
    }

    /// A subscriber with no prefixes yet. Registration is immediate, so any
    /// frame published after this returns and matching a later
    /// [`SubSocket::subscribe`] is delivered.
    pub fn subscriber(&self, name: &str) -> SubSocket {
        let (tx, rx) = flume::unbounded();
        let filters = Arc::new(RwLock::new(Vec::new()));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                name: name.to_string(),
                filters: filters.clone(),
                tx,
            });
        debug!(subscriber = %name, "New subscriber registered");
        SubSocket {
            name: name.to_string(),
            rx,
            filters,
        }
    }

    pub fn sync(&self) -> SyncSocket {
        SyncSocket {
            tx: self.sync_tx.clone(),
        }
    }

    pub fn kill_socket(&self) -> KillSocket {
        KillSocket::new(self.kill.clone())
    }

    pub fn kill_requester(&self) -> KillRequester {
        KillRequester::new(self.kill.clone())
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_fired()
    }
}

/// Owns the forwarder and sync service threads.
///
/// Dropping the broker stops both threads; sockets handed out earlier then
/// report [`BusError::Disconnected`].
pub struct Broker {
    fabric: Fabric,
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Broker {
    pub fn start(config: BrokerConfig) -> Result<Self, BusError> {
        let (backend_tx, backend_rx) = flume::unbounded::<Frame>();
        let (sync_tx, sync_rx) = flume::unbounded::<SyncRequest>();
        // Never sent on; dropping the sender wakes both service loops.
        let (stop_tx, stop_rx) = flume::bounded::<()>(0);
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));

        let forwarder = {
            let subscribers = subscribers.clone();
            let stop_rx = stop_rx.clone();
            thread::Builder::new()
                .name("bus-forwarder".to_string())
                .spawn(move || run_forwarder(backend_rx, subscribers, stop_rx))
                .map_err(|e| BusError::Spawn(e.to_string()))?
        };

        let barrier = Barrier::new(config.participants.iter().cloned());
        let timeout = config.barrier_timeout;
        let sync = thread::Builder::new()
            .name("bus-sync".to_string())
            .spawn(move || run_sync_service(barrier, timeout, sync_rx, stop_rx))
            .map_err(|e| BusError::Spawn(e.to_string()))?;

        info!(
            participants = config.participants.len(),
            barrier_timeout = ?config.barrier_timeout,
            "Broker started"
        );

        Ok(Self {
            fabric: Fabric {
                backend_tx,
                subscribers,
                sync_tx,
                kill: Arc::new(KillHub::new()),
            },
            stop_tx: Some(stop_tx),
            threads: vec![forwarder, sync],
        })
    }

    pub fn fabric(&self) -> Fabric {
        self.fabric.clone()
    }

    /// Stops the service threads and waits for them.
    pub fn shutdown(&mut self) {
        if self.stop_tx.take().is_none() {
            return;
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Broker thread panicked");
            }
        }
        info!("Broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum ForwarderEvent {
    Frame(Frame),
    Stop,
}

fn run_forwarder(backend_rx: Receiver<Frame>, subscribers: Subscribers, stop_rx: Receiver<()>) {
    loop {
        let event = Selector::new()
            .recv(&backend_rx, |r| r.map_or(ForwarderEvent::Stop, ForwarderEvent::Frame))
            .recv(&stop_rx, |_| ForwarderEvent::Stop)
            .wait();
        match event {
            ForwarderEvent::Frame(frame) => forward(&frame, &subscribers),
            ForwarderEvent::Stop => break,
        }
    }
    // Relay what was already published before going away.
    for frame in backend_rx.try_iter() {
        forward(&frame, &subscribers);
    }
    debug!("Forwarder exiting");
}

/// Relays one frame verbatim to every subscriber whose prefixes match,
/// dropping subscribers whose socket is gone.
fn forward(frame: &Frame, subscribers: &Subscribers) {
    let mut dead = Vec::new();
    {
        let subs = subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for (i, sub) in subs.iter().enumerate() {
            if !sub.wants(&frame.topic) {
                continue;
            }
            if sub.tx.send(frame.clone()).is_err() {
                dead.push(i);
            }
        }
    }
    if dead.is_empty() {
        return;
    }
    let mut subs = subscribers.write().unwrap_or_else(PoisonError::into_inner);
    // Indices stay valid: registration only ever appends.
    for i in dead.into_iter().rev() {
        if i < subs.len() && subs[i].tx.is_disconnected() {
            let sub = subs.remove(i);
            debug!(subscriber = %sub.name, "Removed dead subscriber");
        }
    }
}

enum SyncEvent {
    Request(SyncRequest),
    Stop,
}

fn run_sync_service(
    mut barrier: Barrier,
    timeout: Option<Duration>,
    sync_rx: Receiver<SyncRequest>,
    stop_rx: Receiver<()>,
) {
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);
    loop {
        let selector = Selector::new()
            .recv(&sync_rx, |r| r.map_or(SyncEvent::Stop, SyncEvent::Request))
            .recv(&stop_rx, |_| SyncEvent::Stop);

        let event = match deadline {
            Some(deadline) if barrier.state() == BarrierState::Waiting => {
                match selector.wait_deadline(deadline) {
                    Ok(event) => event,
                    Err(_) => {
                        barrier.time_out(started.elapsed());
                        continue;
                    }
                }
            }
            _ => selector.wait(),
        };

        match event {
            SyncEvent::Request(req) => {
                barrier.announce(&req.participant, req.reply);
            }
            SyncEvent::Stop => break,
        }
    }
    if barrier.state() == BarrierState::Waiting {
        warn!(pending = ?barrier.pending(), "Sync service stopped before barrier release");
    }
    debug!("Sync service exiting");
}
