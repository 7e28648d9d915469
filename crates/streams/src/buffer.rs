use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use rig_types::{Sample, Snapshot};
use tracing::debug;

use crate::error::SchemaError;
use crate::rate::RateEstimator;
use crate::schema::StreamSchema;

/// How many samples a [`StreamBuffer::drain`] may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// At most this many of the solidified samples.
    Max(usize),
    /// Every solidified sample.
    Available,
    /// Everything, provisional samples included. Used at shutdown.
    Flush,
}

struct StreamState {
    schema: StreamSchema,
    fifo: Mutex<VecDeque<Sample>>,
    rate: Option<Mutex<RateEstimator>>,
}

struct DeviceEntry {
    /// Serializes append against peek and against clears reaching into the
    /// provisional window. Drain never takes it.
    lock: Mutex<()>,
    streams: RwLock<BTreeMap<String, Arc<StreamState>>>,
}

#[derive(Default)]
struct Inner {
    devices: RwLock<BTreeMap<String, Arc<DeviceEntry>>>,
    metadata: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

/// Thread-safe store of per-(device, stream) FIFOs.
///
/// Cloning yields another handle onto the same buffers, so the appending,
/// draining and peeking roles can each hold their own.
///
/// Locking: every device has one lock taken by `append`, `append_snapshot`,
/// `peek_newest` and full clears. Each FIFO additionally sits behind its own
/// short-held mutex which `drain` takes per popped sample; lock order is
/// always device lock first, FIFO second.
#[derive(Clone, Default)]
pub struct StreamBuffer {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(PoisonError::into_inner)
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a stream. Declaring the same stream again with an identical
    /// schema is a no-op that keeps buffered samples.
    pub fn declare_stream(&self, device: &str, stream: &str, schema: StreamSchema) -> Result<(), SchemaError> {
        schema.check().map_err(|message| SchemaError::InvalidSchema {
            device: device.to_string(),
            stream: stream.to_string(),
            message,
        })?;

        let entry = {
            let mut devices = write(&self.inner.devices);
            devices
                .entry(device.to_string())
                .or_insert_with(|| {
                    Arc::new(DeviceEntry {
                        lock: Mutex::new(()),
                        streams: RwLock::new(BTreeMap::new()),
                    })
                })
                .clone()
        };

        let mut streams = write(&entry.streams);
        if let Some(existing) = streams.get(stream) {
            if existing.schema == schema {
                return Ok(());
            }
            return Err(SchemaError::Conflict {
                device: device.to_string(),
                stream: stream.to_string(),
            });
        }

        let rate = schema
            .measure_rate
            .then(|| Mutex::new(RateEstimator::new(schema.sampling_rate_hz, Instant::now())));
        debug!(device, stream, rate_hz = schema.sampling_rate_hz, "Declared stream");
        streams.insert(
            stream.to_string(),
            Arc::new(StreamState {
                schema,
                fifo: Mutex::new(VecDeque::new()),
                rate,
            }),
        );
        Ok(())
    }

    fn device(&self, device: &str) -> Result<Arc<DeviceEntry>, SchemaError> {
        read(&self.inner.devices)
            .get(device)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownDevice {
                device: device.to_string(),
            })
    }

    fn stream_of(entry: &DeviceEntry, device: &str, stream: &str) -> Result<Arc<StreamState>, SchemaError> {
        read(&entry.streams)
            .get(stream)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownStream {
                device: device.to_string(),
                stream: stream.to_string(),
            })
    }

    fn resolve(&self, device: &str, stream: &str) -> Result<(Arc<DeviceEntry>, Arc<StreamState>), SchemaError> {
        let entry = self.device(device)?;
        let state = Self::stream_of(&entry, device, stream)?;
        Ok((entry, state))
    }

    fn push(state: &StreamState, sample: Sample, arrival: Instant) {
        lock(&state.fifo).push_back(sample);
        if let Some(rate) = &state.rate {
            lock(rate).observe(arrival);
        }
    }

    /// Appends one sample, recording its arrival now.
    pub fn append(&self, device: &str, stream: &str, sample: Sample) -> Result<(), SchemaError> {
        self.append_at(device, stream, sample, Instant::now())
    }

    /// Appends one sample with an explicit arrival instant.
    pub fn append_at(&self, device: &str, stream: &str, sample: Sample, arrival: Instant) -> Result<(), SchemaError> {
        let (entry, state) = self.resolve(device, stream)?;
        let _guard = lock(&entry.lock);
        Self::push(&state, sample, arrival);
        Ok(())
    }

    /// Appends every sample of a snapshot stamped with `time_s`, taking each
    /// device lock once. Devices mapped to `None` are skipped. Every
    /// (device, stream) is checked before anything is appended, so a
    /// rejected snapshot leaves the buffer untouched. Returns the number of
    /// samples appended.
    pub fn append_snapshot(&self, time_s: f64, snapshot: &Snapshot) -> Result<usize, SchemaError> {
        let mut resolved = Vec::with_capacity(snapshot.len());
        for (device, streams) in snapshot {
            let Some(streams) = streams else { continue };
            let entry = self.device(device)?;
            let states = streams
                .iter()
                .map(|(stream, value)| Ok((Self::stream_of(&entry, device, stream)?, value)))
                .collect::<Result<Vec<_>, SchemaError>>()?;
            resolved.push((entry, states));
        }

        let arrival = Instant::now();
        let mut appended = 0;
        for (entry, states) in resolved {
            let _guard = lock(&entry.lock);
            for (state, value) in states {
                Self::push(&state, Sample::new(time_s, value.clone()), arrival);
                appended += 1;
            }
        }
        Ok(appended)
    }

    /// Removes and yields the oldest eligible samples, lazily.
    ///
    /// The eligible count is fixed when the drain is created: all samples
    /// except the newest `timesteps_before_solidified`, capped by `mode`.
    /// Samples appended afterwards are not taken by this drain.
    pub fn drain(&self, device: &str, stream: &str, mode: DrainMode) -> Result<Drain, SchemaError> {
        let (_, state) = self.resolve(device, stream)?;
        let available = lock(&state.fifo).len();
        let poppable = available.saturating_sub(state.schema.timesteps_before_solidified);
        let remaining = match mode {
            DrainMode::Flush => available,
            DrainMode::Available => poppable,
            DrainMode::Max(n) => n.min(poppable),
        };
        Ok(Drain { state, remaining })
    }

    /// Clones of up to `count` newest samples inside the solidify window,
    /// newest first. Never removes anything.
    pub fn peek_newest(&self, device: &str, stream: &str, count: usize) -> Result<Vec<Sample>, SchemaError> {
        let (entry, state) = self.resolve(device, stream)?;
        let _guard = lock(&entry.lock);
        let fifo = lock(&state.fifo);
        let take = count
            .min(state.schema.timesteps_before_solidified)
            .min(fifo.len());
        Ok(fifo.iter().rev().take(take).cloned().collect())
    }

    /// Measured arrival rate, or `None` when the stream is not measured.
    pub fn actual_rate(&self, device: &str, stream: &str) -> Result<Option<f64>, SchemaError> {
        let (_, state) = self.resolve(device, stream)?;
        Ok(state.rate.as_ref().map(|r| lock(r).rate_hz()))
    }

    /// Removes the `oldest` samples, or everything when `None`. Reaching into
    /// the provisional window waits for the device lock. Returns the number
    /// of samples removed.
    pub fn clear(&self, device: &str, stream: &str, oldest: Option<usize>) -> Result<usize, SchemaError> {
        let (entry, state) = self.resolve(device, stream)?;
        match oldest {
            None => {
                let _guard = lock(&entry.lock);
                let mut fifo = lock(&state.fifo);
                let n = fifo.len();
                fifo.clear();
                Ok(n)
            }
            Some(n) => {
                let clearable = lock(&state.fifo)
                    .len()
                    .saturating_sub(state.schema.timesteps_before_solidified);
                let _guard = (n > clearable).then(|| lock(&entry.lock));
                let mut fifo = lock(&state.fifo);
                let n = n.min(fifo.len());
                fifo.drain(..n);
                Ok(n)
            }
        }
    }

    /// Empties every stream of every device.
    pub fn clear_all(&self) {
        let devices: Vec<_> = read(&self.inner.devices).values().cloned().collect();
        for entry in devices {
            let _guard = lock(&entry.lock);
            for state in read(&entry.streams).values() {
                lock(&state.fifo).clear();
            }
        }
    }

    pub fn device_names(&self) -> Vec<String> {
        read(&self.inner.devices).keys().cloned().collect()
    }

    pub fn stream_names(&self, device: &str) -> Result<Vec<String>, SchemaError> {
        let entry = self.device(device)?;
        let names = read(&entry.streams).keys().cloned().collect();
        Ok(names)
    }

    pub fn is_declared(&self, device: &str, stream: &str) -> bool {
        self.resolve(device, stream).is_ok()
    }

    pub fn schema(&self, device: &str, stream: &str) -> Result<StreamSchema, SchemaError> {
        let (_, state) = self.resolve(device, stream)?;
        Ok(state.schema.clone())
    }

    /// Every declared schema, device -> stream -> schema.
    pub fn schemas(&self) -> BTreeMap<String, BTreeMap<String, StreamSchema>> {
        read(&self.inner.devices)
            .iter()
            .map(|(device, entry)| {
                let streams = read(&entry.streams)
                    .iter()
                    .map(|(name, state)| (name.clone(), state.schema.clone()))
                    .collect();
                (device.clone(), streams)
            })
            .collect()
    }

    /// Number of buffered samples in one stream.
    pub fn len(&self, device: &str, stream: &str) -> Result<usize, SchemaError> {
        let (_, state) = self.resolve(device, stream)?;
        let n = lock(&state.fifo).len();
        Ok(n)
    }

    /// Number of buffered samples across all streams.
    pub fn total_len(&self) -> usize {
        read(&self.inner.devices)
            .values()
            .map(|entry| {
                read(&entry.streams)
                    .values()
                    .map(|state| lock(&state.fifo).len())
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Attaches a free-form metadata entry to a device (e.g. serial number).
    pub fn set_metadata(&self, device: &str, key: impl Into<String>, value: impl Into<String>) {
        write(&self.inner.metadata)
            .entry(device.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Metadata for every device.
    pub fn metadata(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        read(&self.inner.metadata).clone()
    }
}

/// Lazy, once-consumable drain of a stream's oldest samples.
///
/// Each call to `next` pops one sample off the FIFO. Dropping the iterator
/// early leaves the untaken samples in place.
pub struct Drain {
    state: Arc<StreamState>,
    remaining: usize,
}

impl Drain {
    /// Samples this drain may still take.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for Drain {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.remaining == 0 {
            return None;
        }
        let sample = lock(&self.state.fifo).pop_front();
        match sample {
            Some(s) => {
                self.remaining -= 1;
                Some(s)
            }
            None => {
                // Cleared underneath us.
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
