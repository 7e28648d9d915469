//! Draining buffered samples out of a node
//!
//! A [`SinkWorker`] runs beside a node's transport loop and periodically
//! moves solidified samples from the node's buffers into a [`SampleSink`].
//! [`LiveView`] is the read-only counterpart for visualization threads.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};
use rig_types::Sample;
use streams::{DrainMode, StreamBuffer};
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::interfaces::SampleSink;

/// Buffers keyed by source tag.
pub type SourceBuffers = BTreeMap<String, StreamBuffer>;

/// Moves every eligible sample of `buffers` into `sink`. Returns how many
/// samples were written.
pub fn drain_into(buffers: &SourceBuffers, mode: DrainMode, sink: &mut dyn SampleSink) -> u64 {
    let mut written = 0u64;
    for (source, buffer) in buffers {
        for device in buffer.device_names() {
            let Ok(streams) = buffer.stream_names(&device) else { continue };
            for stream in streams {
                let samples: Vec<Sample> = match buffer.drain(&device, &stream, mode) {
                    Ok(drain) => drain.collect(),
                    Err(e) => {
                        warn!(error = %e, "Skipping stream while draining");
                        continue;
                    }
                };
                if samples.is_empty() {
                    continue;
                }
                let n = samples.len() as u64;
                match sink.write(source, &device, &stream, samples) {
                    Ok(()) => written += n,
                    Err(e) => error!(%source, %device, %stream, error = %e, "Sink rejected samples"),
                }
            }
        }
    }
    written
}

/// Periodic drain of a set of buffers into a sink, on its own thread.
///
/// Each period takes only solidified samples; stopping the worker flushes
/// everything, provisional samples included, then flushes the sink.
pub struct SinkWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl SinkWorker {
    pub fn spawn(
        name: &str,
        buffers: SourceBuffers,
        mut sink: Box<dyn SampleSink>,
        period: Duration,
    ) -> Result<Self, NodeError> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("{}-sink", name))
            .spawn(move || {
                let mut written = 0u64;
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            written += drain_into(&buffers, DrainMode::Available, sink.as_mut());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                written += drain_into(&buffers, DrainMode::Flush, sink.as_mut());
                if let Err(e) = sink.flush() {
                    error!(error = %e, "Failed to flush sink");
                }
                written
            })
            .map_err(|e| NodeError::Spawn(e.to_string()))?;
        debug!(worker = %name, ?period, "Sink worker started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the worker after a final flush. Returns the total number of
    /// samples written.
    pub fn stop(mut self) -> Result<u64, NodeError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<u64, NodeError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| NodeError::Panicked("sink worker".to_string())),
            None => Ok(0),
        }
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(error = %e, "Sink worker ended abnormally");
        }
    }
}

type Key = (String, String, String);

/// Keeps every written sample in memory. Clones share the same store.
#[derive(Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<BTreeMap<Key, Vec<Sample>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self, source: &str, device: &str, stream: &str) -> Vec<Sample> {
        let key = (source.to_string(), device.to_string(), stream.to_string());
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of samples written for `source`, across all its streams.
    pub fn count(&self, source: &str) -> usize {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((s, _, _), _)| s == source)
            .map(|(_, v)| v.len())
            .sum()
    }
}

impl SampleSink for MemorySink {
    fn write(&mut self, source: &str, device: &str, stream: &str, samples: Vec<Sample>) -> Result<(), NodeError> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((source.to_string(), device.to_string(), stream.to_string()))
            .or_default()
            .extend(samples);
        Ok(())
    }
}

/// Summarizes written samples through `tracing` instead of storing them.
#[derive(Default)]
pub struct TracingSink {
    totals: BTreeMap<Key, u64>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> &BTreeMap<(String, String, String), u64> {
        &self.totals
    }
}

impl SampleSink for TracingSink {
    fn write(&mut self, source: &str, device: &str, stream: &str, samples: Vec<Sample>) -> Result<(), NodeError> {
        let first = samples.first().map(|s| s.time_s);
        let last = samples.last().map(|s| s.time_s);
        debug!(%source, %device, %stream, count = samples.len(), ?first, ?last, "Logged samples");
        *self
            .totals
            .entry((source.to_string(), device.to_string(), stream.to_string()))
            .or_default() += samples.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), NodeError> {
        for ((source, device, stream), total) in &self.totals {
            info!(%source, %device, %stream, total, "Stream summary");
        }
        Ok(())
    }
}

/// Read-only view over a node's mirrored buffers for visualization.
///
/// Peeks never remove samples and only ever see the provisional window,
/// so a viewer can run next to a draining sink worker.
#[derive(Clone)]
pub struct LiveView {
    buffers: SourceBuffers,
}

impl LiveView {
    pub fn new(buffers: SourceBuffers) -> Self {
        Self { buffers }
    }

    pub fn sources(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    pub fn buffer(&self, source: &str) -> Result<&StreamBuffer, NodeError> {
        self.buffers
            .get(source)
            .ok_or_else(|| NodeError::UnknownSource(source.to_string()))
    }

    /// Up to `count` newest samples, newest first.
    pub fn newest(&self, source: &str, device: &str, stream: &str, count: usize) -> Result<Vec<Sample>, NodeError> {
        Ok(self.buffer(source)?.peek_newest(device, stream, count)?)
    }

    pub fn actual_rate(&self, source: &str, device: &str, stream: &str) -> Result<Option<f64>, NodeError> {
        Ok(self.buffer(source)?.actual_rate(device, stream)?)
    }

    pub fn len(&self, source: &str, device: &str, stream: &str) -> Result<usize, NodeError> {
        Ok(self.buffer(source)?.len(device, stream)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_types::Value;
    use streams::StreamSchema;

    fn buffers(window: usize) -> SourceBuffers {
        let buf = StreamBuffer::new();
        buf.declare_stream("insole", "pressure", StreamSchema::new("float64", vec![1], 100.0).solidify_after(window))
            .unwrap();
        let mut map = SourceBuffers::new();
        map.insert("feet".to_string(), buf);
        map
    }

    fn fill(buffers: &SourceBuffers, n: usize) {
        for i in 0..n {
            buffers["feet"]
                .append("insole", "pressure", Sample::new(i as f64, Value::Float(i as f64)))
                .unwrap();
        }
    }

    #[test]
    fn test_drain_into_respects_window() {
        let bufs = buffers(2);
        fill(&bufs, 5);
        let mut sink = MemorySink::new();
        assert_eq!(drain_into(&bufs, DrainMode::Available, &mut sink), 3);
        assert_eq!(sink.count("feet"), 3);
        assert_eq!(drain_into(&bufs, DrainMode::Flush, &mut sink), 2);
        let times: Vec<f64> = sink.samples("feet", "insole", "pressure").iter().map(|s| s.time_s).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_worker_flushes_on_stop() {
        let bufs = buffers(3);
        let sink = MemorySink::new();
        let worker = SinkWorker::spawn("test", bufs.clone(), Box::new(sink.clone()), Duration::from_secs(60)).unwrap();
        fill(&bufs, 10);
        assert_eq!(worker.stop().unwrap(), 10);
        assert_eq!(sink.count("feet"), 10);
        assert!(bufs["feet"].is_empty());
    }

    #[test]
    fn test_worker_drains_periodically() {
        let bufs = buffers(0);
        let sink = MemorySink::new();
        let worker = SinkWorker::spawn("periodic", bufs.clone(), Box::new(sink.clone()), Duration::from_millis(5)).unwrap();
        fill(&bufs, 4);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.count("feet") < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.count("feet"), 4);
        drop(worker);
    }

    #[test]
    fn test_tracing_sink_totals() {
        let bufs = buffers(0);
        fill(&bufs, 7);
        let mut sink = TracingSink::new();
        drain_into(&bufs, DrainMode::Available, &mut sink);
        sink.flush().unwrap();
        let key = ("feet".to_string(), "insole".to_string(), "pressure".to_string());
        assert_eq!(sink.totals()[&key], 7);
    }

    #[test]
    fn test_live_view() {
        let bufs = buffers(2);
        fill(&bufs, 5);
        let view = LiveView::new(bufs);
        let newest = view.newest("feet", "insole", "pressure", 5).unwrap();
        assert_eq!(newest.iter().map(|s| s.time_s).collect::<Vec<_>>(), vec![4.0, 3.0]);
        assert_eq!(view.len("feet", "insole", "pressure").unwrap(), 5);
        assert_eq!(view.actual_rate("feet", "insole", "pressure").unwrap(), None);
        assert!(matches!(view.newest("hands", "insole", "pressure", 1), Err(NodeError::UnknownSource(_))));
    }
}
