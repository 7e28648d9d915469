use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::NodeSpec;
use crate::consumer::{Consumer, Retention};
use crate::error::NodeError;
use crate::lifecycle::Lifecycle;
use crate::registry::{NodeFactory, Upstream};
use crate::sink::TracingSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerParams {
    pub flush_period_ms: u64,
}

impl Default for LoggerParams {
    fn default() -> Self {
        Self { flush_period_ms: 500 }
    }
}

/// Consumer draining everything it mirrors into a [`TracingSink`].
pub struct DataLoggerFactory;

impl NodeFactory for DataLoggerFactory {
    fn build(&self, spec: &NodeSpec, upstream: &Upstream) -> Result<Box<dyn Lifecycle>, NodeError> {
        let params: LoggerParams = spec.decode_params()?;
        let period = Duration::from_millis(params.flush_period_ms.max(1));
        Ok(Box::new(
            Consumer::new(&spec.name, upstream)?.with_sink(Box::new(TracingSink::new()), period),
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyConsumerParams {
    /// Keep only the provisional window instead of every sample.
    pub window_only: bool,
}

/// Consumer that keeps what it receives in memory and traces each message.
pub struct DummyConsumerFactory;

impl NodeFactory for DummyConsumerFactory {
    fn build(&self, spec: &NodeSpec, upstream: &Upstream) -> Result<Box<dyn Lifecycle>, NodeError> {
        let params: DummyConsumerParams = spec.decode_params()?;
        let retention = if params.window_only {
            Retention::WindowOnly
        } else {
            Retention::KeepAll
        };
        let name = spec.name.clone();
        let consumer = Consumer::new(&spec.name, upstream)?
            .with_retention(retention)
            .with_observer(move |source, msg| {
                trace!(node = %name, %source, process_time_s = ?msg.process_time_s(), "Received");
            });
        Ok(Box::new(consumer))
    }
}
