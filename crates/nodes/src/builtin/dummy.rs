//! Synthetic sensor for rig smoke tests.
//!
//! Emits one time-of-arrival sample per emulated device at a fixed rate.

use std::time::{Duration, Instant};

use rig_types::{now_s, DeviceSamples, Snapshot, Value};
use serde::{Deserialize, Serialize};
use streams::{SchemaError, StreamBuffer, StreamSchema};
use tracing::{debug, info};

use crate::config::NodeSpec;
use crate::error::{CollaboratorError, NodeError};
use crate::interfaces::{Connectable, DevicePing, SnapshotSource};
use crate::lifecycle::Lifecycle;
use crate::parts::StreamDecl;
use crate::producer::{AcquisitionMode, Producer};
use crate::registry::{NodeFactory, Upstream};

pub const STREAM: &str = "toa";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyParams {
    pub sampling_rate_hz: f64,
    pub devices: usize,
    /// Stop on its own after this many snapshots.
    pub max_samples: Option<u64>,
    /// Refuse this many connection attempts before succeeding.
    pub failed_connects: u32,
    /// Pull snapshots on a dedicated acquisition thread.
    pub dedicated_thread: bool,
    /// Estimate the link delay this often.
    pub ping_period_ms: Option<u64>,
    /// Emulated one-way link delay answered by pings.
    pub link_delay_ms: u64,
}

impl Default for DummyParams {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 100.0,
            devices: 1,
            max_samples: None,
            failed_connects: 0,
            dedicated_thread: false,
            ping_period_ms: None,
            link_delay_ms: 0,
        }
    }
}

pub struct DummySource {
    params: DummyParams,
    period: Duration,
    connected: bool,
    stopped: bool,
    connect_calls: u32,
    next_due: Option<Instant>,
    emitted: u64,
}

impl DummySource {
    pub fn new(params: DummyParams) -> Self {
        let period = if params.sampling_rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / params.sampling_rate_hz)
        } else {
            Duration::ZERO
        };
        Self {
            params,
            period,
            connected: false,
            stopped: false,
            connect_calls: 0,
            next_due: None,
            emitted: 0,
        }
    }

    pub fn device_name(index: usize) -> String {
        format!("emulator-{}", index)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl Connectable for DummySource {
    fn connect(&mut self) -> bool {
        self.connect_calls += 1;
        if self.connect_calls <= self.params.failed_connects {
            debug!(attempt = self.connect_calls, "Emulator refusing connection");
            return false;
        }
        self.connected = true;
        true
    }

    fn cleanup(&mut self) {
        if self.connected {
            info!(emitted = self.emitted, "Emulator disconnected");
        }
        self.connected = false;
        self.next_due = None;
    }
}

impl SnapshotSource for DummySource {
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError> {
        for i in 0..self.params.devices {
            let schema = StreamSchema::new("float64", vec![1], self.params.sampling_rate_hz)
                .note("Data headings", "time of arrival (s)");
            let schema = if self.params.sampling_rate_hz > 0.0 { schema.measured() } else { schema };
            buffer.declare_stream(&Self::device_name(i), STREAM, schema)?;
        }
        Ok(())
    }

    fn get_snapshot(&mut self) -> Result<Option<Snapshot>, CollaboratorError> {
        if !self.connected {
            return Err(CollaboratorError::Disconnected("emulator not connected".to_string()));
        }
        if self.stopped || self.is_exhausted() {
            return Ok(None);
        }
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if now < due {
            return Ok(None);
        }
        self.next_due = Some(due + self.period);

        let toa = now_s();
        let mut snapshot = Snapshot::new();
        for i in 0..self.params.devices {
            let mut samples = DeviceSamples::new();
            samples.insert(STREAM.to_string(), Value::Float(toa));
            snapshot.insert(Self::device_name(i), Some(samples));
        }
        self.emitted += 1;
        Ok(Some(snapshot))
    }

    fn stop_new_data(&mut self) {
        self.stopped = true;
    }

    fn is_exhausted(&self) -> bool {
        self.params.max_samples.is_some_and(|max| self.emitted >= max)
    }

    fn pinger(&self) -> Option<Box<dyn DevicePing>> {
        Some(Box::new(EmulatedLink {
            one_way: Duration::from_millis(self.params.link_delay_ms),
        }))
    }
}

/// Answers pings after the emulated round trip.
struct EmulatedLink {
    one_way: Duration,
}

impl DevicePing for EmulatedLink {
    fn ping(&mut self) -> Result<(), CollaboratorError> {
        std::thread::sleep(self.one_way * 2);
        Ok(())
    }
}

pub struct DummyProducerFactory;

impl NodeFactory for DummyProducerFactory {
    fn streams(&self, spec: &NodeSpec) -> Result<Vec<StreamDecl>, NodeError> {
        let buffer = StreamBuffer::new();
        DummySource::new(spec.decode_params()?).declare_streams(&buffer)?;
        Ok(StreamDecl::all_of(&buffer))
    }

    fn build(&self, spec: &NodeSpec, _upstream: &Upstream) -> Result<Box<dyn Lifecycle>, NodeError> {
        let params: DummyParams = spec.decode_params()?;
        let mode = if params.dedicated_thread {
            AcquisitionMode::Dedicated
        } else {
            AcquisitionMode::Inline
        };
        let ping_period = params.ping_period_ms.map(Duration::from_millis);
        let mut producer = Producer::new(&spec.name, DummySource::new(params))?.with_mode(mode);
        if let Some(period) = ping_period {
            producer = producer.with_delay_estimation(period);
        }
        Ok(Box::new(producer))
    }
}
