//! The node lifecycle and the thread that drives it
//!
//! Every node type implements [`Lifecycle`]; [`spawn_node`] runs it through
//! `Created -> Connecting -> SyncWait -> Streaming -> Stopping -> CleanedUp`
//! on a dedicated, named thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bus::{BusError, Fabric, KillSocket, PollEvent, Poller};
use flume::Sender;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::state::{NodeEvent, NodeReport, NodeState};

/// Consecutive failed steps after which stopping gives up on the rest.
const MAX_STOPPING_FAILURES: u32 = 20;

/// Result of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep going.
    Continue,
    /// The kill broadcast arrived.
    Kill,
    /// The node ran out of work on its own.
    Exhausted,
    /// The collaborator was lost; reconnect before the next step.
    Reconnect,
    /// Stopping is complete: everything received, sent and ended.
    Done,
}

/// Per-step view of the runner handed to [`Lifecycle::step`].
pub struct StepContext<'a> {
    kill: Option<&'a KillSocket>,
    poll_timeout: Duration,
    stopping: bool,
}

impl<'a> StepContext<'a> {
    pub fn new(kill: Option<&'a KillSocket>, poll_timeout: Duration, stopping: bool) -> Self {
        Self {
            kill,
            poll_timeout,
            stopping,
        }
    }

    /// A poller already watching the kill socket while streaming.
    pub fn poller(&self) -> Poller<'a> {
        match self.kill {
            Some(kill) => Poller::new().with_kill(kill),
            None => Poller::new(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Checks for the kill without blocking longer than `timeout`.
    pub fn check_kill(&self, timeout: Duration) -> Step {
        match self.kill {
            Some(kill) => match Poller::new().with_kill(kill).poll(timeout) {
                PollEvent::Kill => Step::Kill,
                _ => Step::Continue,
            },
            None => {
                if !timeout.is_zero() {
                    thread::sleep(timeout);
                }
                Step::Continue
            }
        }
    }
}

/// Counters a node reports when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub messages_out: u64,
    pub messages_in: u64,
}

/// Behaviour of one node type, driven by the runner.
pub trait Lifecycle: Send {
    /// Source tag; also the topic prefix and barrier identity.
    fn tag(&self) -> &str;

    /// Creates the node's sockets. Called once, before the first connect.
    fn attach(&mut self, fabric: &Fabric) -> Result<(), NodeError>;

    /// One connection attempt.
    fn connect(&mut self) -> bool {
        true
    }

    /// Releases partial state after a failed attempt or a lost connection.
    fn teardown(&mut self) {}

    /// Called when streaming starts and again after every reconnection.
    fn start_streaming(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// One unit of work, while streaming or while stopping.
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Step, NodeError>;

    /// Stop taking in new data; called once on entering `Stopping`.
    fn trigger_stop(&mut self) {}

    /// Sends END, flushes sinks and joins helpers. Called exactly once.
    fn finish(&mut self) -> NodeSummary;
}

/// Runner settings shared by every node of a rig.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(50),
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle onto a running node thread.
pub struct NodeHandle {
    tag: String,
    state: Arc<Mutex<NodeState>>,
    thread: JoinHandle<NodeReport>,
}

impl NodeHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<NodeReport, NodeError> {
        self.thread
            .join()
            .map_err(|_| NodeError::Panicked(format!("node '{}' thread", self.tag)))
    }
}

/// Starts `node` on its own thread.
pub fn spawn_node(
    node: Box<dyn Lifecycle>,
    fabric: Fabric,
    settings: NodeSettings,
    events: Option<Sender<NodeEvent>>,
) -> Result<NodeHandle, NodeError> {
    let tag = node.tag().to_string();
    let state = Arc::new(Mutex::new(NodeState::Created));
    let runner = Runner {
        kill: fabric.kill_socket(),
        report: NodeReport::new(&tag),
        node,
        fabric,
        settings,
        events,
        state: state.clone(),
    };
    let thread = thread::Builder::new()
        .name(format!("node-{}", tag))
        .spawn(move || runner.run())
        .map_err(|e| NodeError::Spawn(e.to_string()))?;
    Ok(NodeHandle { tag, state, thread })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn guarded<T>(f: impl FnOnce() -> Result<T, NodeError>) -> Result<T, NodeError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| Err(NodeError::Panicked(panic_message(p))))
}

struct Runner {
    node: Box<dyn Lifecycle>,
    fabric: Fabric,
    kill: KillSocket,
    settings: NodeSettings,
    events: Option<Sender<NodeEvent>>,
    state: Arc<Mutex<NodeState>>,
    report: NodeReport,
}

impl Runner {
    fn tag(&self) -> &str {
        &self.report.tag
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_state(&mut self, to: NodeState) {
        let from = self.report.state;
        if !from.can_transition_to(to) {
            error!(node = %self.tag(), %from, %to, "Illegal state transition");
            return;
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
        self.report.state = to;
        debug!(node = %self.tag(), %from, %to, "State changed");
        self.emit(NodeEvent::StateChanged {
            node: self.report.tag.clone(),
            from,
            to,
        });
    }

    fn fail(&mut self, err: &NodeError) {
        error!(node = %self.tag(), error = %err, "Node failed");
        self.report.error.get_or_insert_with(|| err.to_string());
    }

    fn run(mut self) -> NodeReport {
        self.set_state(NodeState::Connecting);
        let streaming = self.connect_and_sync();
        if streaming {
            self.stream();
        } else {
            // Peers parked at the barrier would otherwise wait for us forever.
            self.fabric.kill_requester().request();
            self.set_state(NodeState::Stopping);
        }
        self.cleanup();
        self.report
    }

    /// Connecting and SyncWait. Returns whether streaming may begin.
    fn connect_and_sync(&mut self) -> bool {
        let fabric = self.fabric.clone();
        if let Err(e) = guarded(|| self.node.attach(&fabric)) {
            self.fail(&e);
            return false;
        }

        if !self.connect_with_retry() {
            return false;
        }

        self.set_state(NodeState::SyncWait);
        let tag = self.report.tag.clone();
        match self.fabric.sync().announce(&tag, Some(&self.kill), None) {
            Ok(()) => info!(node = %tag, "Barrier released"),
            Err(BusError::Killed) => {
                info!(node = %tag, "Killed while waiting at barrier");
                return false;
            }
            Err(e) => {
                self.fail(&NodeError::from(e));
                return false;
            }
        }

        if let Err(e) = guarded(|| self.node.start_streaming()) {
            self.fail(&e);
            return false;
        }
        self.set_state(NodeState::Streaming);
        true
    }

    /// Retries `connect()` with teardown in between. Returns `false` if the
    /// kill arrived or the policy gave up.
    fn connect_with_retry(&mut self) -> bool {
        let tag = self.report.tag.clone();
        let node = &mut self.node;
        let kill = &self.kill;
        let outcome = retry(
            &self.settings.retry,
            |attempt| {
                let ok = catch_unwind(AssertUnwindSafe(|| node.connect())).unwrap_or_else(|p| {
                    error!(node = %tag, panic = %panic_message(p), "connect() panicked");
                    false
                });
                if !ok {
                    warn!(node = %tag, attempt, "Connection attempt failed");
                    if catch_unwind(AssertUnwindSafe(|| node.teardown())).is_err() {
                        error!(node = %tag, "teardown() panicked");
                    }
                }
                ok
            },
            |delay| !matches!(Poller::new().with_kill(kill).poll(delay), PollEvent::Kill),
        );

        self.report.connect_attempts += outcome.attempts();
        match outcome {
            RetryOutcome::Succeeded { attempts } => {
                info!(node = %tag, attempts, "Connected");
                self.emit(NodeEvent::Connected { node: tag, attempts });
                true
            }
            RetryOutcome::Aborted { attempts } => {
                info!(node = %tag, attempts, "Kill received while connecting");
                false
            }
            RetryOutcome::Exhausted { attempts } => {
                self.report
                    .error
                    .get_or_insert_with(|| format!("gave up connecting after {} attempts", attempts));
                error!(node = %tag, attempts, "Gave up connecting");
                false
            }
        }
    }

    /// Reconnects in place after the collaborator was lost.
    fn reconnect(&mut self) -> bool {
        warn!(node = %self.tag(), "Collaborator lost, reconnecting");
        if catch_unwind(AssertUnwindSafe(|| self.node.teardown())).is_err() {
            error!(node = %self.tag(), "teardown() panicked");
        }
        if !self.connect_with_retry() {
            return false;
        }
        match guarded(|| self.node.start_streaming()) {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// Streaming and Stopping.
    fn stream(&mut self) {
        let poll_timeout = self.settings.poll_timeout;
        let mut fatal = false;

        loop {
            let ctx = StepContext::new(Some(&self.kill), poll_timeout, false);
            let result = guarded(|| self.node.step(&ctx));
            match result {
                Ok(Step::Continue) => {}
                Ok(Step::Kill) => {
                    info!(node = %self.tag(), "Received kill");
                    break;
                }
                Ok(Step::Exhausted) | Ok(Step::Done) => {
                    info!(node = %self.tag(), "Out of data, requesting kill");
                    break;
                }
                Ok(Step::Reconnect) => {
                    if !self.reconnect() {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.fail(&e);
                    fatal = true;
                    break;
                }
                Err(e) => {
                    warn!(node = %self.tag(), error = %e, "Step failed, skipping tick");
                    if matches!(Poller::new().with_kill(&self.kill).poll(poll_timeout), PollEvent::Kill) {
                        info!(node = %self.tag(), "Received kill");
                        break;
                    }
                }
            }
        }

        // Whatever ended streaming here ends it for the whole rig.
        self.fabric.kill_requester().request();
        self.set_state(NodeState::Stopping);
        if fatal {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| self.node.trigger_stop())).is_err() {
            error!(node = %self.tag(), "trigger_stop() panicked");
        }

        let mut failures = 0;
        loop {
            let ctx = StepContext::new(None, poll_timeout, true);
            let result = guarded(|| self.node.step(&ctx));
            if result.is_ok() {
                failures = 0;
            }
            match result {
                Ok(Step::Done) => break,
                Ok(Step::Reconnect) => {
                    warn!(node = %self.tag(), "Collaborator lost while stopping, giving up on remaining data");
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.fail(&e);
                    break;
                }
                Err(e) => {
                    failures += 1;
                    warn!(node = %self.tag(), error = %e, failures, "Step failed while stopping");
                    if failures >= MAX_STOPPING_FAILURES {
                        self.fail(&e);
                        break;
                    }
                    thread::sleep(poll_timeout);
                }
            }
        }
    }

    fn cleanup(&mut self) {
        match catch_unwind(AssertUnwindSafe(|| self.node.finish())) {
            Ok(summary) => {
                self.report.messages_out = summary.messages_out;
                self.report.messages_in = summary.messages_in;
            }
            Err(p) => {
                let err = NodeError::Panicked(panic_message(p));
                self.fail(&err);
            }
        }
        self.set_state(NodeState::CleanedUp);
        info!(
            node = %self.tag(),
            published = self.report.messages_out,
            received = self.report.messages_in,
            "Node exited"
        );
        self.emit(NodeEvent::Finished(self.report.clone()));
    }
}
