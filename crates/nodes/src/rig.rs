//! Brings up a whole rig: broker, nodes and their threads.

use std::time::Duration;

use bus::{Broker, BrokerConfig, Fabric, KillRequester};
use flume::Sender;
use tracing::{error, info};

use crate::config::RigConfig;
use crate::error::NodeError;
use crate::lifecycle::{spawn_node, Lifecycle, NodeHandle, NodeSettings};
use crate::registry::NodeRegistry;
use crate::state::{NodeEvent, NodeReport, NodeState};

/// A running rig. Every node runs on its own thread; the broker outlives
/// them all.
pub struct Rig {
    broker: Broker,
    fabric: Fabric,
    handles: Vec<NodeHandle>,
}

impl Rig {
    /// Builds every node of `config` through `registry` and starts them.
    pub fn launch(config: &RigConfig, registry: &NodeRegistry) -> Result<Self, NodeError> {
        Self::launch_with_events(config, registry, None)
    }

    pub fn launch_with_events(
        config: &RigConfig,
        registry: &NodeRegistry,
        events: Option<Sender<NodeEvent>>,
    ) -> Result<Self, NodeError> {
        let nodes = registry.build_all(config)?;
        info!(host = %config.host, nodes = nodes.len(), "Launching rig");
        Self::spawn(nodes, config.barrier_timeout(), config.settings(), events)
    }

    /// Starts already built nodes. The barrier expects exactly these nodes.
    pub fn spawn(
        nodes: Vec<Box<dyn Lifecycle>>,
        barrier_timeout: Option<Duration>,
        settings: NodeSettings,
        events: Option<Sender<NodeEvent>>,
    ) -> Result<Self, NodeError> {
        let broker = Broker::start(BrokerConfig {
            participants: nodes.iter().map(|n| n.tag().to_string()).collect(),
            barrier_timeout,
        })?;
        let fabric = broker.fabric();
        let mut rig = Self {
            broker,
            fabric,
            handles: Vec::with_capacity(nodes.len()),
        };

        for node in nodes {
            match spawn_node(node, rig.fabric.clone(), settings.clone(), events.clone()) {
                Ok(handle) => rig.handles.push(handle),
                Err(e) => {
                    error!(error = %e, "Failed to start node, stopping rig");
                    rig.kill();
                    rig.wait();
                    return Err(e);
                }
            }
        }
        Ok(rig)
    }

    pub fn fabric(&self) -> Fabric {
        self.fabric.clone()
    }

    pub fn kill_requester(&self) -> KillRequester {
        self.fabric.kill_requester()
    }

    /// Broadcasts the kill. Returns `false` if it was already sent.
    pub fn kill(&self) -> bool {
        self.fabric.kill_requester().request()
    }

    pub fn states(&self) -> Vec<(String, NodeState)> {
        self.handles
            .iter()
            .map(|h| (h.tag().to_string(), h.state()))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(NodeHandle::is_finished)
    }

    /// Waits for every node thread, then stops the broker.
    pub fn wait(mut self) -> Vec<NodeReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            let tag = handle.tag().to_string();
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(node = %tag, error = %e, "Node thread died");
                    let mut report = NodeReport::new(&tag);
                    report.error = Some(e.to_string());
                    reports.push(report);
                }
            }
        }
        self.broker.shutdown();
        info!(nodes = reports.len(), "Rig stopped");
        reports
    }
}
