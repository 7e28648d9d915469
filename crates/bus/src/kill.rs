use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flume::{Receiver, Sender};
use tracing::info;

/// The single logical stop signal of a rig.
///
/// Firing is idempotent: only the first call broadcasts. Sockets created
/// after the kill fired receive it immediately.
#[derive(Default)]
pub struct KillHub {
    fired: AtomicBool,
    subscribers: Mutex<Vec<Sender<()>>>,
}

impl KillHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the kill. Returns `true` for the call that actually fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        info!(subscribers = subscribers.len(), "Broadcasting kill");
        for tx in subscribers.iter() {
            let _ = tx.try_send(());
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = flume::bounded(1);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fired.load(Ordering::SeqCst) {
            let _ = tx.try_send(());
        }
        subscribers.push(tx);
        rx
    }
}

/// Receiving end of the kill broadcast owned by one node.
pub struct KillSocket {
    pub(crate) rx: Receiver<()>,
    hub: Arc<KillHub>,
}

impl KillSocket {
    pub(crate) fn new(hub: Arc<KillHub>) -> Self {
        Self {
            rx: hub.subscribe(),
            hub,
        }
    }

    /// Whether the kill has been broadcast, regardless of whether this socket
    /// consumed the notification yet.
    pub fn is_set(&self) -> bool {
        self.hub.is_fired()
    }
}

/// Asks the broker to broadcast the kill. Cheap to clone and hand to any
/// thread (experiment control, stdin watcher, signal handler).
#[derive(Clone)]
pub struct KillRequester {
    hub: Arc<KillHub>,
}

impl KillRequester {
    pub(crate) fn new(hub: Arc<KillHub>) -> Self {
        Self { hub }
    }

    /// Requests the kill. Returns `true` if this request fired it.
    pub fn request(&self) -> bool {
        self.hub.fire()
    }

    pub fn is_killed(&self) -> bool {
        self.hub.is_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_is_idempotent() {
        let hub = Arc::new(KillHub::new());
        let socket = KillSocket::new(hub.clone());
        assert!(!socket.is_set());

        assert!(hub.fire());
        assert!(!hub.fire());
        assert!(socket.is_set());
        assert!(socket.rx.try_recv().is_ok());
        // Only one notification per socket.
        assert!(socket.rx.try_recv().is_err());
    }

    #[test]
    fn test_late_socket_sees_kill() {
        let hub = Arc::new(KillHub::new());
        KillRequester::new(hub.clone()).request();
        let late = KillSocket::new(hub);
        assert!(late.rx.try_recv().is_ok());
    }
}
