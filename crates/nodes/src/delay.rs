//! Transmission delay estimation
//!
//! Devices that cannot sync to the host clock are pinged periodically on a
//! helper thread. Half of each round trip is published on the producer's
//! `"<tag>.connection"` topic so recordings can be aligned afterwards.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bus::{BusError, PubSocket};
use flume::{RecvTimeoutError, Sender};
use rig_types::{now_s, DeviceSamples, Frame, Message, Snapshot, Value};
use tracing::{debug, error, warn};

use crate::error::{CollaboratorError, NodeError};
use crate::interfaces::DevicePing;

/// Stream carrying the delay estimate, in seconds.
pub const DELAY_STREAM: &str = "transmission_delay";

/// One-way delay estimated from a single blocking ping.
pub fn estimate_delay(ping: &mut dyn DevicePing) -> Result<f64, CollaboratorError> {
    let sent = Instant::now();
    ping.ping()?;
    Ok(sent.elapsed().as_secs_f64() / 2.0)
}

/// The message published for one estimate: device `"<tag>-connection"`
/// with a single [`DELAY_STREAM`] sample.
pub fn delay_message(tag: &str, time_s: f64, delay_s: f64) -> Message {
    let mut link = DeviceSamples::new();
    link.insert(DELAY_STREAM.to_string(), Value::Float(delay_s));
    let mut snapshot = Snapshot::new();
    snapshot.insert(format!("{}-connection", tag), Some(link));
    Message::from_snapshot(time_s, &snapshot)
}

/// Pings a device every period on its own thread and publishes the
/// estimates.
pub struct DelayEstimator {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl DelayEstimator {
    pub fn spawn(
        tag: &str,
        mut ping: Box<dyn DevicePing>,
        period: Duration,
        publisher: PubSocket,
    ) -> Result<Self, NodeError> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let node = tag.to_string();
        let handle = thread::Builder::new()
            .name(format!("{}-delay", tag))
            .spawn(move || {
                let mut published = 0u64;
                loop {
                    match catch_unwind(AssertUnwindSafe(|| estimate_delay(ping.as_mut()))) {
                        Ok(Ok(delay_s)) => {
                            let sent = Frame::connection(&node, &delay_message(&node, now_s(), delay_s))
                                .map_err(BusError::from)
                                .and_then(|frame| publisher.send(frame));
                            match sent {
                                Ok(()) => published += 1,
                                Err(BusError::Disconnected) => break,
                                Err(e) => warn!(%node, error = %e, "Failed to publish delay estimate"),
                            }
                        }
                        Ok(Err(e)) => warn!(%node, error = %e, "Ping failed"),
                        Err(_) => error!(%node, "ping() panicked"),
                    }
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                published
            })
            .map_err(|e| NodeError::Spawn(e.to_string()))?;
        debug!(node = %tag, ?period, "Delay estimator started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Asks the thread to stop after its current ping.
    pub fn signal_stop(&self) {
        if let Some(tx) = &self.stop_tx {
            let _ = tx.try_send(());
        }
    }

    /// Stops and joins the thread. Returns how many estimates went out.
    pub fn stop(mut self) -> Result<u64, NodeError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<u64, NodeError> {
        self.signal_stop();
        self.stop_tx = None;
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| NodeError::Panicked("delay estimator".to_string())),
            None => Ok(0),
        }
    }
}

impl Drop for DelayEstimator {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(error = %e, "Delay estimator ended abnormally");
        }
    }
}
