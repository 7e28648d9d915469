use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bus::{Fabric, PubSocket};
use flume::{Receiver, RecvTimeoutError, Sender};
use rig_types::{now_s, Snapshot};
use streams::StreamBuffer;
use tracing::{debug, error, info, warn};

use crate::delay::DelayEstimator;
use crate::error::{CollaboratorError, NodeError};
use crate::interfaces::{Publishable, SampleSink, SnapshotSource};
use crate::lifecycle::{Lifecycle, NodeSummary, Step, StepContext};
use crate::parts::{discard_solidified, Outlet};
use crate::sink::{SinkWorker, SourceBuffers};

/// Pause between empty pulls from a source.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Outcome of a tick whose pull failed. Once stopping, a failing source has
/// nothing more to give.
fn skip_tick(ctx: &StepContext<'_>) -> Step {
    if ctx.is_stopping() {
        Step::Done
    } else {
        ctx.check_kill(IDLE_WAIT)
    }
}

/// Where `get_snapshot` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    /// On the node thread, between kill checks.
    #[default]
    Inline,
    /// On a helper thread, for sources whose calls block for long.
    Dedicated,
}

enum Acquired {
    Snapshot(f64, Snapshot),
    Lost(String),
    Finished,
}

/// Helper thread owning the source while streaming in dedicated mode.
struct AcquisitionThread<S> {
    rx: Receiver<Acquired>,
    stop_tx: Sender<()>,
    handle: JoinHandle<S>,
}

impl<S: SnapshotSource + 'static> AcquisitionThread<S> {
    fn spawn(tag: &str, mut source: S) -> Result<Self, NodeError> {
        let (tx, rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let node = tag.to_string();
        let handle = thread::Builder::new()
            .name(format!("{}-acq", tag))
            .spawn(move || {
                let mut stopped = false;
                loop {
                    if !stopped && !stop_rx.is_empty() {
                        source.stop_new_data();
                        stopped = true;
                    }
                    let pulled = catch_unwind(AssertUnwindSafe(|| source.get_snapshot()));
                    let message = match pulled {
                        Ok(Ok(Some(snapshot))) => Acquired::Snapshot(now_s(), snapshot),
                        Ok(Ok(None)) if stopped || source.is_exhausted() => Acquired::Finished,
                        Ok(Ok(None)) => {
                            thread::sleep(IDLE_WAIT);
                            continue;
                        }
                        Ok(Err(CollaboratorError::Disconnected(msg))) => Acquired::Lost(msg),
                        Ok(Err(CollaboratorError::Transient(msg))) if stopped => {
                            warn!(%node, error = %msg, "Acquisition error while stopping, dropping the rest");
                            Acquired::Finished
                        }
                        Ok(Err(CollaboratorError::Transient(msg))) => {
                            warn!(%node, error = %msg, "Transient acquisition error");
                            thread::sleep(IDLE_WAIT);
                            continue;
                        }
                        Err(_) if stopped => {
                            error!(%node, "get_snapshot() panicked while stopping, dropping the rest");
                            Acquired::Finished
                        }
                        Err(_) => {
                            error!(%node, "get_snapshot() panicked, skipping tick");
                            thread::sleep(IDLE_WAIT);
                            continue;
                        }
                    };
                    let last = !matches!(message, Acquired::Snapshot(..));
                    if tx.send(message).is_err() || last {
                        break;
                    }
                }
                source
            })
            .map_err(|e| NodeError::Spawn(e.to_string()))?;
        Ok(Self { rx, stop_tx, handle })
    }

    fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    fn join(self) -> Option<S> {
        self.stop();
        self.handle.join().ok()
    }
}

/// A node owning a hardware collaborator: pulls snapshots, stores them in
/// its stream buffer and publishes them on `"<tag>.data"`.
pub struct Producer<S: SnapshotSource + 'static> {
    source: Option<S>,
    outlet: Outlet,
    mode: AcquisitionMode,
    acquisition: Option<AcquisitionThread<S>>,
    sink: Option<(Box<dyn SampleSink>, Duration)>,
    sink_worker: Option<SinkWorker>,
    delay_period: Option<Duration>,
    delay_publisher: Option<PubSocket>,
    estimator: Option<DelayEstimator>,
}

impl<S: SnapshotSource + 'static> Producer<S> {
    pub fn new(tag: &str, source: S) -> Result<Self, NodeError> {
        let outlet = Outlet::new(tag);
        source.declare_streams(outlet.buffer())?;
        Ok(Self {
            source: Some(source),
            outlet,
            mode: AcquisitionMode::Inline,
            acquisition: None,
            sink: None,
            sink_worker: None,
            delay_period: None,
            delay_publisher: None,
            estimator: None,
        })
    }

    pub fn with_mode(mut self, mode: AcquisitionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Logs the producer's own samples into `sink` every `period`.
    /// Without a sink, only the provisional window is kept.
    pub fn with_sink(mut self, sink: Box<dyn SampleSink>, period: Duration) -> Self {
        self.sink = Some((sink, period));
        self
    }

    /// Estimates the link delay every `period` while streaming and
    /// publishes it on `"<tag>.connection"`. Needs a source that offers a
    /// [`pinger`](SnapshotSource::pinger).
    pub fn with_delay_estimation(mut self, period: Duration) -> Self {
        self.delay_period = Some(period);
        self
    }

    pub fn buffer(&self) -> StreamBuffer {
        self.outlet.buffer().clone()
    }

    fn emit(&mut self, time_s: f64, snapshot: Snapshot) -> Result<(), NodeError> {
        self.outlet.emit(time_s, &snapshot)?;
        if self.sink_worker.is_none() {
            discard_solidified(self.outlet.buffer());
        }
        Ok(())
    }

    fn take_back_source(&mut self) {
        if let Some(acq) = self.acquisition.take() {
            match acq.join() {
                Some(source) => self.source = Some(source),
                None => error!(node = %self.outlet.tag(), "Acquisition thread panicked"),
            }
        }
    }

    fn start_delay_estimation(&mut self, period: Duration) -> Result<(), NodeError> {
        let Some(ping) = self.source.as_ref().and_then(|s| s.pinger()) else {
            warn!(node = %self.outlet.tag(), "Source cannot be pinged, no delay estimates");
            self.delay_period = None;
            return Ok(());
        };
        let publisher = self
            .delay_publisher
            .clone()
            .ok_or_else(|| NodeError::NotAttached(self.outlet.tag().to_string()))?;
        self.estimator = Some(DelayEstimator::spawn(self.outlet.tag(), ping, period, publisher)?);
        Ok(())
    }

    fn step_inline(&mut self, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| NodeError::NotAttached(self.outlet.tag().to_string()))?;
        let pulled = match catch_unwind(AssertUnwindSafe(|| source.get_snapshot())) {
            Ok(Ok(pulled)) => pulled,
            Ok(Err(CollaboratorError::Disconnected(msg))) => {
                warn!(node = %self.outlet.tag(), error = %msg, "Device disconnected");
                return Ok(Step::Reconnect);
            }
            Ok(Err(CollaboratorError::Transient(msg))) => {
                warn!(node = %self.outlet.tag(), error = %msg, "Transient acquisition error");
                return Ok(skip_tick(ctx));
            }
            Err(_) => {
                error!(node = %self.outlet.tag(), "get_snapshot() panicked, skipping tick");
                return Ok(skip_tick(ctx));
            }
        };
        let exhausted = pulled.is_none() && source.is_exhausted();
        match pulled {
            Some(snapshot) => {
                self.emit(now_s(), snapshot)?;
                Ok(ctx.check_kill(Duration::ZERO))
            }
            None if ctx.is_stopping() => Ok(Step::Done),
            None if exhausted => Ok(Step::Exhausted),
            None => Ok(ctx.check_kill(IDLE_WAIT)),
        }
    }

    fn step_dedicated(&mut self, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        let Some(acq) = self.acquisition.as_ref() else {
            return Ok(if ctx.is_stopping() { Step::Done } else { Step::Exhausted });
        };
        match acq.rx.recv_timeout(ctx.poll_timeout()) {
            Ok(Acquired::Snapshot(time_s, snapshot)) => {
                self.emit(time_s, snapshot)?;
                Ok(ctx.check_kill(Duration::ZERO))
            }
            Ok(Acquired::Lost(msg)) => {
                warn!(node = %self.outlet.tag(), error = %msg, "Device disconnected");
                self.take_back_source();
                Ok(Step::Reconnect)
            }
            Ok(Acquired::Finished) | Err(RecvTimeoutError::Disconnected) => {
                self.take_back_source();
                Ok(if ctx.is_stopping() { Step::Done } else { Step::Exhausted })
            }
            Err(RecvTimeoutError::Timeout) => Ok(ctx.check_kill(Duration::ZERO)),
        }
    }
}

impl<S: SnapshotSource + 'static> Publishable for Producer<S> {
    fn topic(&self) -> String {
        self.outlet.topic()
    }

    fn published(&self) -> &StreamBuffer {
        self.outlet.buffer()
    }
}

impl<S: SnapshotSource + 'static> Lifecycle for Producer<S> {
    fn tag(&self) -> &str {
        self.outlet.tag()
    }

    fn attach(&mut self, fabric: &Fabric) -> Result<(), NodeError> {
        self.outlet.attach(fabric);
        if self.delay_period.is_some() {
            self.delay_publisher = Some(fabric.publisher());
        }
        Ok(())
    }

    fn connect(&mut self) -> bool {
        self.source.as_mut().is_some_and(|s| s.connect())
    }

    fn teardown(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.cleanup();
        }
    }

    fn start_streaming(&mut self) -> Result<(), NodeError> {
        if self.sink_worker.is_none() {
            if let Some((sink, period)) = self.sink.take() {
                let mut own = SourceBuffers::new();
                own.insert(self.outlet.tag().to_string(), self.outlet.buffer().clone());
                self.sink_worker = Some(SinkWorker::spawn(self.outlet.tag(), own, sink, period)?);
            }
        }
        if self.estimator.is_none() {
            if let Some(period) = self.delay_period {
                self.start_delay_estimation(period)?;
            }
        }
        if self.mode == AcquisitionMode::Dedicated {
            if let Some(source) = self.source.take() {
                debug!(node = %self.outlet.tag(), "Starting acquisition thread");
                self.acquisition = Some(AcquisitionThread::spawn(self.outlet.tag(), source)?);
            }
        }
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        match self.mode {
            AcquisitionMode::Inline => self.step_inline(ctx),
            AcquisitionMode::Dedicated => self.step_dedicated(ctx),
        }
    }

    fn trigger_stop(&mut self) {
        if let Some(estimator) = &self.estimator {
            estimator.signal_stop();
        }
        match &self.acquisition {
            Some(acq) => acq.stop(),
            None => {
                if let Some(source) = self.source.as_mut() {
                    source.stop_new_data();
                }
            }
        }
    }

    fn finish(&mut self) -> NodeSummary {
        self.take_back_source();
        if let Err(e) = self.outlet.end() {
            error!(node = %self.outlet.tag(), error = %e, "Failed to send END");
        }
        if let Some(worker) = self.sink_worker.take() {
            match worker.stop() {
                Ok(written) => info!(node = %self.outlet.tag(), written, "Local log flushed"),
                Err(e) => error!(node = %self.outlet.tag(), error = %e, "Local log failed"),
            }
        }
        if let Some(estimator) = self.estimator.take() {
            match estimator.stop() {
                Ok(estimates) => debug!(node = %self.outlet.tag(), estimates, "Delay estimator stopped"),
                Err(e) => error!(node = %self.outlet.tag(), error = %e, "Delay estimator failed"),
            }
        }
        if let Some(source) = self.source.as_mut() {
            source.cleanup();
        }
        NodeSummary {
            messages_out: self.outlet.published(),
            messages_in: 0,
        }
    }
}
