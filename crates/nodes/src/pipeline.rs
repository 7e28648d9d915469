use std::collections::BTreeMap;

use bus::{Fabric, PollEvent};
use rig_types::{now_s, Frame};
use streams::StreamBuffer;
use tracing::{error, info};

use crate::error::NodeError;
use crate::interfaces::{Publishable, Subscribable, Transform};
use crate::lifecycle::{Lifecycle, NodeSummary, Step, StepContext};
use crate::parts::{discard_solidified, Inbound, Inlet, Outlet, StreamDecl};

/// A node that consumes upstream data and publishes a derived stream.
///
/// Its own END goes out once every input has ended, so downstream nodes
/// never see END before the last derived message.
pub struct Pipeline<T: Transform> {
    transform: T,
    inlet: Inlet,
    outlet: Outlet,
}

impl<T: Transform> Pipeline<T> {
    pub fn new(tag: &str, upstream: &BTreeMap<String, Vec<StreamDecl>>, transform: T) -> Result<Self, NodeError> {
        let outlet = Outlet::new(tag);
        transform.declare_streams(outlet.buffer())?;
        Ok(Self {
            inlet: Inlet::new(tag, upstream)?,
            outlet,
            transform,
        })
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    fn on_frame(&mut self, frame: &Frame, ctx: &StepContext<'_>) -> Result<Step, NodeError> {
        match self.inlet.handle(frame)? {
            Inbound::Data { source, msg } => {
                self.inlet.discard_solidified();
                if let Some(derived) = self.transform.process(&source, &msg)? {
                    self.outlet.emit(now_s(), &derived)?;
                    discard_solidified(self.outlet.buffer());
                }
                Ok(Step::Continue)
            }
            Inbound::End { .. } if self.inlet.all_finished() => {
                info!(node = %self.outlet.tag(), "All inputs ended");
                self.outlet.end()?;
                Ok(if ctx.is_stopping() { Step::Done } else { Step::Exhausted })
            }
            Inbound::End { .. } | Inbound::Ignored => Ok(Step::Continue),
        }
    }
}

impl<T: Transform> Publishable for Pipeline<T> {
    fn topic(&self) -> String {
        self.outlet.topic()
    }

    fn published(&self) -> &StreamBuffer {
        self.outlet.buffer()
    }
}

impl<T: Transform> Subscribable for Pipeline<T> {
    fn sources(&self) -> Vec<String> {
        self.inlet.mirrors().keys().cloned().collect()
    }

    fn mirror(&self, source: &str) -> Option<&StreamBuffer> {
        self.inlet.mirrors().get(source)
    }
}

impl<T: Transform> Lifecycle for Pipeline<T> {
    fn tag(&self) -> &str {
        self.outlet.tag()
    }

    fn attach(&mut self, fabric: &Fabric) -> Result<(), NodeError> {
        self.inlet.attach(fabric);
        self.outlet.attach(fabric);
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
            PollEvent::Disconnected if ctx.is_stopping() => Ok(Step::Done),
            PollEvent::Disconnected => Ok(Step::Kill),
        }
    }

    fn finish(&mut self) -> NodeSummary {
        if let Err(e) = self.outlet.end() {
            error!(node = %self.outlet.tag(), error = %e, "Failed to send END");
        }
        NodeSummary {
            messages_out: self.outlet.published(),
            messages_in: self.inlet.received(),
        }
    }
}
