use std::collections::BTreeMap;
use std::time::Duration;

use bus::{Fabric, PollEvent};
use rig_types::Message;
use streams::StreamBuffer;
use tracing::{debug, error, info};

use crate::error::NodeError;
use crate::interfaces::{SampleSink, Subscribable};
use crate::lifecycle::{Lifecycle, NodeSummary, Step, StepContext};
use crate::parts::{Inbound, Inlet, StreamDecl};
use crate::sink::{LiveView, SinkWorker};

/// What a consumer without a sink keeps of its mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Every received sample stays until someone drains it.
    #[default]
    KeepAll,
    /// Only the provisional window, enough for a live view.
    WindowOnly,
}

type Observer = Box<dyn FnMut(&str, &Message) + Send>;

/// A node mirroring one or more upstream producers.
pub struct Consumer {
    tag: String,
    inlet: Inlet,
    retention: Retention,
    observer: Option<Observer>,
    sink: Option<(Box<dyn SampleSink>, Duration)>,
    sink_worker: Option<SinkWorker>,
}

impl Consumer {
    pub fn new(tag: &str, upstream: &BTreeMap<String, Vec<StreamDecl>>) -> Result<Self, NodeError> {
        Ok(Self {
            tag: tag.to_string(),
            inlet: Inlet::new(tag, upstream)?,
            retention: Retention::KeepAll,
            observer: None,
            sink: None,
            sink_worker: None,
        })
    }

    /// Drains the mirrors into `sink` every `period` while streaming.
    pub fn with_sink(mut self, sink: Box<dyn SampleSink>, period: Duration) -> Self {
        self.sink = Some((sink, period));
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Called with every data message, after it was mirrored.
    pub fn with_observer(mut self, observer: impl FnMut(&str, &Message) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Read-only view over the mirrors, for visualization threads.
    pub fn live_view(&self) -> LiveView {
        LiveView::new(self.inlet.mirrors().clone())
    }

    fn on_frame(&mut self, frame: &rig_types::Frame, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        match self.inlet.handle(frame)? {
            Inbound::Data { source, msg } => {
                if let Some(observer) = self.observer.as_mut() {
                    observer(&source, &msg);
                }
                if self.sink_worker.is_none() && self.retention == Retention::WindowOnly {
                    self.inlet.discard_solidified();
                }
                Ok(Step::Continue)
            }
            Inbound::End { .. } if self.inlet.all_finished() => {
                info!(node = %self.tag, "All sources ended");
                Ok(if ctx.is_stopping() { Step::Done } else { Step::Exhausted })
            }
            Inbound::End { .. } | Inbound::Ignored => Ok(Step::Continue),
        }
    }
}

impl Subscribable for Consumer {
    fn sources(&self) -> Vec<String> {
        self.inlet.mirrors().keys().cloned().collect()
    }

    fn mirror(&self, source: &str) -> Option<&StreamBuffer> {
        self.inlet.mirrors().get(source)
    }
}

impl Lifecycle for Consumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn attach(&mut self, fabric: &Fabric) -> Result<(), NodeError> {
        self.inlet.attach(fabric);
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), NodeError> {
        if self.sink_worker.is_none() {
            if let Some((sink, period)) = self.sink.take() {
                let buffers = self.inlet.mirrors().clone();
                self.sink_worker = Some(SinkWorker::spawn(&self.tag, buffers, sink, period)?);
            }
        }
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        if self.inlet.all_finished() {
            return Ok(if ctx.is_stopping() { Step::Done } else { Step::Exhausted });
        }
        let event = ctx.poller().with_sub(self.inlet.socket()?).poll(ctx.poll_timeout());
        match event {
            PollEvent::Frame(frame) => self.on_frame(&frame, ctx),
            PollEvent::Kill => Ok(Step::Kill),
            PollEvent::Timeout => Ok(Step::Continue),
            PollEvent::Disconnected if ctx.is_stopping() => {
                debug!(node = %self.tag, "Broker gone while stopping");
                Ok(Step::Done)
            }
            PollEvent::Disconnected => Ok(Step::Kill),
        }
    }

    fn finish(&mut self) -> NodeSummary {
        if let Some(worker) = self.sink_worker.take() {
            match worker.stop() {
                Ok(written) => info!(node = %self.tag, written, "Sink flushed"),
                Err(e) => error!(node = %self.tag, error = %e, "Sink worker failed"),
            }
        }
        NodeSummary {
            messages_out: 0,
            messages_in: self.inlet.received(),
        }
    }
}
