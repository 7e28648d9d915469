use std::fmt;

use serde::Serialize;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Created,
    Connecting,
    SyncWait,
    Streaming,
    Stopping,
    CleanedUp,
}

impl NodeState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Besides the forward path, a node may jump to `Stopping` from
    /// `Connecting` or `SyncWait` when the kill arrives (or the barrier
    /// fails) before streaming began.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, SyncWait)
                | (Connecting, Stopping)
                | (SyncWait, Streaming)
                | (SyncWait, Stopping)
                | (Streaming, Stopping)
                | (Stopping, CleanedUp)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a node did over its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub tag: String,
    pub state: NodeState,
    /// Calls to `connect()`, reconnections included.
    pub connect_attempts: u32,
    pub messages_out: u64,
    pub messages_in: u64,
    /// The error that ended the node early, if any.
    pub error: Option<String>,
}

impl NodeReport {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            state: NodeState::Created,
            connect_attempts: 0,
            messages_out: 0,
            messages_in: 0,
            error: None,
        }
    }
}

/// Observable lifecycle events, for supervisors and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    StateChanged {
        node: String,
        from: NodeState,
        to: NodeState,
    },
    Connected {
        node: String,
        attempts: u32,
    },
    Finished(NodeReport),
}
