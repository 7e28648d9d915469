use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nodes::builtin::{DummyParams, DummySource};
use nodes::{
    AcquisitionMode, CollaboratorError, Connectable, Consumer, Lifecycle, MemorySink, NodeEvent, NodeReport,
    NodeSettings, NodeState, Producer, RetryPolicy, Rig, SnapshotSource, StreamDecl, DELAY_STREAM,
};
use rig_types::{connection_topic, DeviceSamples, Envelope, Snapshot, Value};
use streams::{SchemaError, StreamBuffer, StreamSchema};

const DEVICE: &str = "board";
const STREAM: &str = "counter";

/// Emits `limit` snapshots, then idles until told to stop.
struct CountingSource {
    limit: u64,
    emitted: Arc<AtomicU64>,
    connects: Arc<AtomicU32>,
    exhaust: bool,
    rogue: bool,
}

impl CountingSource {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            emitted: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicU32::new(0)),
            exhaust: false,
            rogue: false,
        }
    }
}

impl Connectable for CountingSource {
    fn connect(&mut self) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn cleanup(&mut self) {}
}

impl SnapshotSource for CountingSource {
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError> {
        buffer.declare_stream(DEVICE, STREAM, StreamSchema::new("int64", vec![1], 1000.0).solidify_after(5))
    }

    fn get_snapshot(&mut self) -> Result<Option<Snapshot>, CollaboratorError> {
        let n = self.emitted.load(Ordering::SeqCst);
        if n >= self.limit {
            return Ok(None);
        }
        let mut samples = DeviceSamples::new();
        samples.insert(STREAM.to_string(), Value::Int(n as i64));
        if self.rogue {
            samples.insert("undeclared".to_string(), Value::Int(0));
        }
        let mut snapshot = Snapshot::new();
        snapshot.insert(DEVICE.to_string(), Some(samples));
        self.emitted.store(n + 1, Ordering::SeqCst);
        Ok(Some(snapshot))
    }

    fn is_exhausted(&self) -> bool {
        self.exhaust && self.emitted.load(Ordering::SeqCst) >= self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fault {
    /// Every pull fails with a transient error.
    Glitch,
    /// Every pull panics.
    Crash,
    /// The device drops once after this many samples.
    DropAfter(u64),
}

/// Counter source misbehaving in one configured way.
struct FaultySource {
    fault: Fault,
    limit: u64,
    pulls: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    connects: Arc<AtomicU32>,
    dropped: bool,
}

impl FaultySource {
    fn new(fault: Fault, limit: u64) -> Self {
        Self {
            fault,
            limit,
            pulls: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicU32::new(0)),
            dropped: false,
        }
    }
}

impl Connectable for FaultySource {
    fn connect(&mut self) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn cleanup(&mut self) {}
}

impl SnapshotSource for FaultySource {
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError> {
        CountingSource::new(0).declare_streams(buffer)
    }

    fn get_snapshot(&mut self) -> Result<Option<Snapshot>, CollaboratorError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let n = self.emitted.load(Ordering::SeqCst);
        match self.fault {
            Fault::Glitch => return Err(CollaboratorError::Transient("checksum mismatch".into())),
            Fault::Crash => panic!("driver crashed"),
            Fault::DropAfter(at) if at == n && !self.dropped => {
                self.dropped = true;
                return Err(CollaboratorError::Disconnected("cable pulled".into()));
            }
            Fault::DropAfter(_) => {}
        }
        if n >= self.limit {
            return Ok(None);
        }
        let mut samples = DeviceSamples::new();
        samples.insert(STREAM.to_string(), Value::Int(n as i64));
        let mut snapshot = Snapshot::new();
        snapshot.insert(DEVICE.to_string(), Some(samples));
        self.emitted.store(n + 1, Ordering::SeqCst);
        Ok(Some(snapshot))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings() -> NodeSettings {
    init_tracing();
    NodeSettings {
        poll_timeout: Duration::from_millis(10),
        retry: RetryPolicy::unbounded(Duration::from_millis(5)),
    }
}

fn boxed(node: impl Lifecycle + 'static) -> Box<dyn Lifecycle> {
    Box::new(node)
}

fn upstream_of(tags: &[&str]) -> BTreeMap<String, Vec<StreamDecl>> {
    tags.iter()
        .map(|tag| {
            let buffer = StreamBuffer::new();
            CountingSource::new(0).declare_streams(&buffer).unwrap();
            (tag.to_string(), StreamDecl::all_of(&buffer))
        })
        .collect()
}

fn wait_until(what: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

fn run_three_producers(with_sink: bool) {
    const TAGS: [&str; 3] = ["mocap", "emg", "insoles"];
    let mut counters = Vec::new();
    let mut nodes: Vec<Box<dyn Lifecycle>> = Vec::new();
    for tag in TAGS {
        let source = CountingSource::new(100);
        counters.push(source.emitted.clone());
        nodes.push(Box::new(Producer::new(tag, source).unwrap()));
    }

    let sink = MemorySink::new();
    let mut consumer = Consumer::new("logger", &upstream_of(&TAGS)).unwrap();
    if with_sink {
        consumer = consumer.with_sink(Box::new(sink.clone()), Duration::from_millis(5));
    }
    let view = consumer.live_view();
    nodes.push(Box::new(consumer));

    let (tx, rx) = flume::unbounded();
    let rig = Rig::spawn(nodes, None, settings(), Some(tx)).unwrap();
    wait_until("100 samples per producer", Duration::from_secs(10), || {
        counters.iter().all(|c| c.load(Ordering::SeqCst) == 100)
    });
    assert!(rig.kill());
    let reports = rig.wait();

    assert_eq!(reports.len(), 4);
    for report in &reports {
        assert_eq!(report.state, NodeState::CleanedUp, "{:?}", report);
        assert_eq!(report.error, None);
    }
    let logger = reports.iter().find(|r| r.tag == "logger").unwrap();
    assert_eq!(logger.messages_in, 300);

    for tag in TAGS {
        if with_sink {
            let samples = sink.samples(tag, DEVICE, STREAM);
            let values: Vec<i64> = samples
                .iter()
                .map(|s| match s.data {
                    Value::Int(v) => v,
                    ref other => panic!("unexpected {:?}", other),
                })
                .collect();
            assert_eq!(values, (0..100).collect::<Vec<i64>>());
        } else {
            assert_eq!(view.len(tag, DEVICE, STREAM).unwrap(), 100);
        }
    }

    // Nobody streamed before all four had reached the barrier.
    let events: Vec<NodeEvent> = rx.drain().collect();
    let first_streaming = events
        .iter()
        .position(|e| matches!(e, NodeEvent::StateChanged { to: NodeState::Streaming, .. }))
        .unwrap();
    let sync_waits = events[..first_streaming]
        .iter()
        .filter(|e| matches!(e, NodeEvent::StateChanged { to: NodeState::SyncWait, .. }))
        .count();
    assert_eq!(sync_waits, 4);
}

#[test]
fn test_three_producers_one_consumer_in_memory() {
    run_three_producers(false);
}

#[test]
fn test_three_producers_one_logging_consumer() {
    run_three_producers(true);
}

#[test]
fn test_sync_wait_after_third_connect() {
    let source = DummySource::new(DummyParams {
        failed_connects: 2,
        sampling_rate_hz: 200.0,
        ..Default::default()
    });
    let node = Producer::new("flaky", source).unwrap();
    let (tx, rx) = flume::unbounded();
    let rig = Rig::spawn(vec![boxed(node)], None, settings(), Some(tx)).unwrap();

    wait_until("streaming", Duration::from_secs(5), || {
        rig.states().iter().all(|(_, s)| *s == NodeState::Streaming)
    });
    rig.kill();
    let reports = rig.wait();
    assert_eq!(reports[0].connect_attempts, 3);
    assert_eq!(reports[0].state, NodeState::CleanedUp);

    let events: Vec<NodeEvent> = rx.drain().collect();
    let connected = events
        .iter()
        .position(|e| matches!(e, NodeEvent::Connected { attempts: 3, .. }))
        .unwrap();
    let sync_wait = events
        .iter()
        .position(|e| matches!(e, NodeEvent::StateChanged { to: NodeState::SyncWait, .. }))
        .unwrap();
    assert!(connected < sync_wait);
}

#[test]
fn test_end_delivers_exactly_k_messages() {
    const K: u64 = 37;
    let mut source = CountingSource::new(K);
    source.exhaust = true;
    let producer = Producer::new("counter", source).unwrap();

    let sink = MemorySink::new();
    let consumer = Consumer::new("logger", &upstream_of(&["counter"]))
        .unwrap()
        .with_sink(Box::new(sink.clone()), Duration::from_millis(5));

    // No explicit kill: the exhausted producer ends the rig by itself.
    let rig = Rig::spawn(vec![boxed(producer), boxed(consumer)], None, settings(), None).unwrap();
    let reports = rig.wait();

    assert_eq!(sink.count("counter"), K as usize);
    let counter = reports.iter().find(|r| r.tag == "counter").unwrap();
    let logger = reports.iter().find(|r| r.tag == "logger").unwrap();
    assert_eq!(counter.messages_out, K);
    assert_eq!(logger.messages_in, K);
    assert!(reports.iter().all(|r| r.state == NodeState::CleanedUp));
}

#[test]
fn test_schema_violation_fails_fast() {
    let mut source = CountingSource::new(10);
    source.rogue = true;
    let emitted = source.emitted.clone();
    let producer = Producer::new("rogue", source).unwrap();
    let consumer = Consumer::new("logger", &upstream_of(&["rogue"])).unwrap();
    let view = consumer.live_view();

    let rig = Rig::spawn(vec![boxed(producer), boxed(consumer)], None, settings(), None).unwrap();
    let reports = rig.wait();

    let rogue = reports.iter().find(|r| r.tag == "rogue").unwrap();
    assert!(rogue.error.as_deref().unwrap_or_default().contains("undeclared"));
    assert_eq!(rogue.messages_out, 0);
    assert_eq!(emitted.load(Ordering::SeqCst), 1);
    assert_eq!(view.len("rogue", DEVICE, STREAM).unwrap(), 0);
    assert!(reports.iter().all(|r| r.state == NodeState::CleanedUp));
}

#[test]
fn test_connect_counter_sees_every_attempt() {
    let source = CountingSource::new(0);
    let connects = source.connects.clone();
    let producer = Producer::new("idle", source).unwrap();
    let rig = Rig::spawn(vec![boxed(producer)], None, settings(), None).unwrap();
    wait_until("streaming", Duration::from_secs(5), || {
        rig.states()[0].1 == NodeState::Streaming
    });
    rig.kill();
    rig.wait();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

/// Runs a single producer whose every pull fails, then kills the rig.
fn kill_failing_producer(fault: Fault, mode: AcquisitionMode) -> NodeReport {
    let source = FaultySource::new(fault, 10);
    let pulls = source.pulls.clone();
    let producer = Producer::new("faulty", source).unwrap().with_mode(mode);
    let rig = Rig::spawn(vec![boxed(producer)], None, settings(), None).unwrap();

    wait_until("failing pulls", Duration::from_secs(5), || pulls.load(Ordering::SeqCst) >= 5);
    assert_eq!(rig.states()[0].1, NodeState::Streaming);

    // Failed ticks are paced, not spun.
    let before = pulls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    let during = pulls.load(Ordering::SeqCst) - before;
    assert!(during < 1000, "{} pulls in 200ms", during);

    assert!(rig.kill());
    wait_until("clean up after kill", Duration::from_secs(5), || rig.is_finished());
    let mut reports = rig.wait();
    reports.remove(0)
}

fn assert_clean(report: &NodeReport) {
    assert_eq!(report.state, NodeState::CleanedUp, "{:?}", report);
    assert_eq!(report.error, None);
    assert_eq!(report.messages_out, 0);
    assert_eq!(report.connect_attempts, 1);
}

#[test]
fn test_transient_errors_skip_ticks_and_honor_kill() {
    assert_clean(&kill_failing_producer(Fault::Glitch, AcquisitionMode::Inline));
}

#[test]
fn test_panicking_source_skips_ticks_and_honors_kill() {
    assert_clean(&kill_failing_producer(Fault::Crash, AcquisitionMode::Inline));
}

#[test]
fn test_transient_errors_on_acquisition_thread_honor_kill() {
    assert_clean(&kill_failing_producer(Fault::Glitch, AcquisitionMode::Dedicated));
}

#[test]
fn test_panicking_source_on_acquisition_thread_honors_kill() {
    assert_clean(&kill_failing_producer(Fault::Crash, AcquisitionMode::Dedicated));
}

fn reconnect_after_drop(mode: AcquisitionMode) {
    const LIMIT: u64 = 50;
    let source = FaultySource::new(Fault::DropAfter(20), LIMIT);
    let emitted = source.emitted.clone();
    let connects = source.connects.clone();
    let producer = Producer::new("flaky", source).unwrap().with_mode(mode);
    let (tx, rx) = flume::unbounded();
    let rig = Rig::spawn(vec![boxed(producer)], None, settings(), Some(tx)).unwrap();

    wait_until("all samples after reconnecting", Duration::from_secs(10), || {
        emitted.load(Ordering::SeqCst) == LIMIT
    });
    rig.kill();
    let reports = rig.wait();

    assert_eq!(connects.load(Ordering::SeqCst), 2);
    let report = &reports[0];
    assert_eq!(report.connect_attempts, 2);
    assert_eq!(report.messages_out, LIMIT);
    assert_eq!(report.error, None);
    assert_eq!(report.state, NodeState::CleanedUp);

    let events: Vec<NodeEvent> = rx.drain().collect();
    let connected = events
        .iter()
        .filter(|e| matches!(e, NodeEvent::Connected { .. }))
        .count();
    assert_eq!(connected, 2);
    // Reconnecting does not go back through the barrier.
    let sync_waits = events
        .iter()
        .filter(|e| matches!(e, NodeEvent::StateChanged { to: NodeState::SyncWait, .. }))
        .count();
    assert_eq!(sync_waits, 1);
}

#[test]
fn test_reconnects_after_disconnect_inline() {
    reconnect_after_drop(AcquisitionMode::Inline);
}

#[test]
fn test_reconnects_after_disconnect_on_acquisition_thread() {
    reconnect_after_drop(AcquisitionMode::Dedicated);
}

#[test]
fn test_delay_estimates_on_connection_topic() {
    let params = DummyParams {
        sampling_rate_hz: 100.0,
        link_delay_ms: 3,
        ..Default::default()
    };
    let buffer = StreamBuffer::new();
    DummySource::new(params.clone()).declare_streams(&buffer).unwrap();
    let mut upstream = BTreeMap::new();
    upstream.insert("linked".to_string(), StreamDecl::all_of(&buffer));

    let producer = Producer::new("linked", DummySource::new(params))
        .unwrap()
        .with_delay_estimation(Duration::from_millis(10));
    let consumer = Consumer::new("logger", &upstream).unwrap();
    let rig = Rig::spawn(vec![boxed(producer), boxed(consumer)], None, settings(), None).unwrap();

    let watcher = rig.fabric().subscriber("watcher");
    watcher.subscribe(connection_topic("linked"));
    for _ in 0..3 {
        let frame = watcher
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("delay estimate");
        let Envelope::Data(msg) = frame.envelope().unwrap() else {
            panic!("unexpected END on the connection topic");
        };
        let snapshot = msg.snapshot().unwrap();
        let delay = snapshot["linked-connection"].as_ref().unwrap()[DELAY_STREAM]
            .as_f64()
            .unwrap();
        assert!(delay >= 0.003, "{}", delay);
    }

    rig.kill();
    let reports = rig.wait();
    let linked = reports.iter().find(|r| r.tag == "linked").unwrap();
    let logger = reports.iter().find(|r| r.tag == "logger").unwrap();
    assert!(reports.iter().all(|r| r.state == NodeState::CleanedUp && r.error.is_none()));
    // Estimates never reach data subscribers.
    assert_eq!(logger.messages_in, linked.messages_out);
}
