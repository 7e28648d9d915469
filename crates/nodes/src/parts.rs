//! Composable transport halves of a node
//!
//! An [`Outlet`] owns what a node publishes: its stream buffer, its publish
//! socket and the end-of-stream bookkeeping. An [`Inlet`] owns what a node
//! receives: its subscription and one mirrored buffer per upstream source.

use std::collections::{BTreeMap, BTreeSet};

use bus::{Fabric, PubSocket, SubSocket};
use rig_types::{data_topic, source_of, Envelope, Frame, Message, Snapshot};
use streams::{DrainMode, SchemaError, StreamBuffer, StreamSchema};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::sink::SourceBuffers;

/// One declared stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDecl {
    pub device: String,
    pub stream: String,
    pub schema: StreamSchema,
}

impl StreamDecl {
    pub fn new(device: impl Into<String>, stream: impl Into<String>, schema: StreamSchema) -> Self {
        Self {
            device: device.into(),
            stream: stream.into(),
            schema,
        }
    }

    /// Every stream declared in `buffer`.
    pub fn all_of(buffer: &StreamBuffer) -> Vec<StreamDecl> {
        buffer
            .schemas()
            .into_iter()
            .flat_map(|(device, streams)| {
                streams
                    .into_iter()
                    .map(move |(stream, schema)| StreamDecl::new(device.clone(), stream, schema))
            })
            .collect()
    }
}

/// Drops every solidified sample, keeping only the provisional window.
pub(crate) fn discard_solidified(buffer: &StreamBuffer) {
    for device in buffer.device_names() {
        let Ok(streams) = buffer.stream_names(&device) else { continue };
        for stream in streams {
            if let Ok(drain) = buffer.drain(&device, &stream, DrainMode::Available) {
                drain.for_each(drop);
            }
        }
    }
}

/// Publishing half of a node.
pub struct Outlet {
    tag: String,
    buffer: StreamBuffer,
    publisher: Option<PubSocket>,
    ended: bool,
    published: u64,
}

impl Outlet {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            buffer: StreamBuffer::new(),
            publisher: None,
            ended: false,
            published: 0,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn topic(&self) -> String {
        data_topic(&self.tag)
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn attach(&mut self, fabric: &Fabric) {
        self.publisher = Some(fabric.publisher());
    }

    fn socket(&self) -> Result<&PubSocket, NodeError> {
        self.publisher
            .as_ref()
            .ok_or_else(|| NodeError::NotAttached(self.tag.clone()))
    }

    /// Stores `snapshot` and publishes it with `process_time_s`.
    ///
    /// The snapshot is appended first so a schema violation is caught before
    /// anything reaches subscribers.
    pub fn emit(&mut self, process_time_s: f64, snapshot: &Snapshot) -> Result<(), NodeError> {
        self.buffer.append_snapshot(process_time_s, snapshot)?;
        self.publish(&Message::from_snapshot(process_time_s, snapshot))
    }

    /// Publishes an already assembled message.
    pub fn publish(&mut self, msg: &Message) -> Result<(), NodeError> {
        if self.ended {
            warn!(node = %self.tag, "Dropping publish after END");
            return Ok(());
        }
        self.socket()?.publish(&self.tag, msg)?;
        self.published += 1;
        Ok(())
    }

    /// Publishes END on the node's topic. Only the first call sends.
    pub fn end(&mut self) -> Result<(), NodeError> {
        if self.ended {
            return Ok(());
        }
        self.socket()?.end(&self.tag)?;
        self.ended = true;
        info!(node = %self.tag, published = self.published, "Sent END");
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// What an [`Inlet`] made of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Data from `source`, already mirrored.
    Data { source: String, msg: Message },
    /// `source` sent END.
    End { source: String },
    /// Nothing to act on (foreign topic, data after END).
    Ignored,
}

/// Receiving half of a node.
pub struct Inlet {
    name: String,
    mirrors: SourceBuffers,
    sub: Option<SubSocket>,
    finished: BTreeSet<String>,
    warned: BTreeSet<(String, String, String)>,
    received: u64,
}

impl Inlet {
    /// An inlet for `upstream`: source tag -> streams that source publishes.
    pub fn new(name: &str, upstream: &BTreeMap<String, Vec<StreamDecl>>) -> Result<Self, SchemaError> {
        let mut mirrors = SourceBuffers::new();
        for (source, decls) in upstream {
            let buffer = StreamBuffer::new();
            for decl in decls {
                buffer.declare_stream(&decl.device, &decl.stream, decl.schema.clone())?;
            }
            mirrors.insert(source.clone(), buffer);
        }
        Ok(Self {
            name: name.to_string(),
            mirrors,
            sub: None,
            finished: BTreeSet::new(),
            warned: BTreeSet::new(),
            received: 0,
        })
    }

    /// Subscribes to every upstream data topic.
    pub fn attach(&mut self, fabric: &Fabric) {
        let sub = fabric.subscriber(&self.name);
        for source in self.mirrors.keys() {
            sub.subscribe(data_topic(source));
        }
        self.sub = Some(sub);
    }

    pub fn socket(&self) -> Result<&SubSocket, NodeError> {
        self.sub
            .as_ref()
            .ok_or_else(|| NodeError::NotAttached(self.name.clone()))
    }

    pub fn mirrors(&self) -> &SourceBuffers {
        &self.mirrors
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_finished(&self, source: &str) -> bool {
        self.finished.contains(source)
    }

    /// Whether every upstream source has sent END.
    pub fn all_finished(&self) -> bool {
        self.mirrors.keys().all(|s| self.finished.contains(s))
    }

    /// Decodes one frame, mirroring data samples into the source's buffer.
    pub fn handle(&mut self, frame: &Frame) -> Result<Inbound, NodeError> {
        let Some(source) = source_of(&frame.topic).filter(|s| self.mirrors.contains_key(*s)) else {
            debug!(node = %self.name, topic = %frame.topic, "Ignoring frame on foreign topic");
            return Ok(Inbound::Ignored);
        };
        let source = source.to_string();

        if self.finished.contains(&source) {
            warn!(node = %self.name, %source, "Dropping data received after END");
            return Ok(Inbound::Ignored);
        }

        match frame.envelope()? {
            Envelope::End => {
                info!(node = %self.name, %source, "Received END");
                self.finished.insert(source.clone());
                Ok(Inbound::End { source })
            }
            Envelope::Data(msg) => {
                self.received += 1;
                let snapshot = self.keep_declared(&source, msg.snapshot()?);
                let time_s = msg.process_time_s().unwrap_or_else(rig_types::now_s);
                if let Some(buffer) = self.mirrors.get(&source) {
                    buffer.append_snapshot(time_s, &snapshot)?;
                }
                Ok(Inbound::Data { source, msg })
            }
        }
    }

    /// Removes streams the source never declared, warning once per stream.
    fn keep_declared(&mut self, source: &str, mut snapshot: Snapshot) -> Snapshot {
        let Some(buffer) = self.mirrors.get(source) else {
            return Snapshot::new();
        };
        for (device, streams) in snapshot.iter_mut() {
            let Some(streams) = streams else { continue };
            streams.retain(|stream, _| {
                if buffer.is_declared(device, stream) {
                    return true;
                }
                let key = (source.to_string(), device.clone(), stream.clone());
                if self.warned.insert(key) {
                    warn!(node = %self.name, %source, %device, %stream, "Dropping undeclared stream");
                }
                false
            });
        }
        snapshot
    }

    /// Keeps only the provisional window of every mirror.
    pub fn discard_solidified(&self) {
        for buffer in self.mirrors.values() {
            discard_solidified(buffer);
        }
    }
}
