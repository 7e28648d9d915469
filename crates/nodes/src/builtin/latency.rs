//! Processing delay of each upstream message, as a derived stream.

use rig_types::{now_s, DeviceSamples, Message, Snapshot, Value};
use streams::{SchemaError, StreamBuffer, StreamSchema};
use tracing::debug;

use crate::config::NodeSpec;
use crate::error::NodeError;
use crate::interfaces::Transform;
use crate::lifecycle::Lifecycle;
use crate::parts::StreamDecl;
use crate::pipeline::Pipeline;
use crate::registry::{NodeFactory, Upstream};

pub const STREAM: &str = "delay_s";

/// Publishes `now - process_time_s` for every message, one device per
/// upstream source.
pub struct LatencyTransform {
    sources: Vec<String>,
}

impl LatencyTransform {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }
}

impl Transform for LatencyTransform {
    fn declare_streams(&self, buffer: &StreamBuffer) -> Result<(), SchemaError> {
        for source in &self.sources {
            // Follows the upstream rate, so nothing to declare.
            buffer.declare_stream(source, STREAM, StreamSchema::new("float64", vec![1], 0.0))?;
        }
        Ok(())
    }

    fn process(&mut self, source: &str, msg: &Message) -> Result<Option<Snapshot>, NodeError> {
        let Some(sent) = msg.process_time_s() else {
            debug!(%source, "Message without process time");
            return Ok(None);
        };
        let mut samples = DeviceSamples::new();
        samples.insert(STREAM.to_string(), Value::Float(now_s() - sent));
        let mut snapshot = Snapshot::new();
        snapshot.insert(source.to_string(), Some(samples));
        Ok(Some(snapshot))
    }
}

pub struct LatencyProbeFactory;

impl NodeFactory for LatencyProbeFactory {
    fn streams(&self, spec: &NodeSpec) -> Result<Vec<StreamDecl>, NodeError> {
        let buffer = StreamBuffer::new();
        LatencyTransform::new(&spec.inputs).declare_streams(&buffer)?;
        Ok(StreamDecl::all_of(&buffer))
    }

    fn build(&self, spec: &NodeSpec, upstream: &Upstream) -> Result<Box<dyn Lifecycle>, NodeError> {
        let transform = LatencyTransform::new(&spec.inputs);
        Ok(Box::new(Pipeline::new(&spec.name, upstream, transform)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_per_source() {
        let mut probe = LatencyTransform::new(["cam", "imu"]);
        let buffer = StreamBuffer::new();
        probe.declare_streams(&buffer).unwrap();
        assert_eq!(buffer.device_names(), vec!["cam", "imu"]);

        let msg = Message::new().with(Message::PROCESS_TIME, now_s() - 0.5);
        let out = probe.process("imu", &msg).unwrap().unwrap();
        let delay = out["imu"].as_ref().unwrap()[STREAM].as_f64().unwrap();
        assert!(delay >= 0.5 && delay < 5.0);
        assert_eq!(buffer.append_snapshot(1.0, &out).unwrap(), 1);
    }

    #[test]
    fn test_message_without_time_is_skipped() {
        let mut probe = LatencyTransform::new(["cam"]);
        assert!(probe.process("cam", &Message::new()).unwrap().is_none());
    }
}
