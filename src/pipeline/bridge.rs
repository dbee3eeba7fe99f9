//! Boundary between the running network and whoever drives it.
//!
//! The network executor and its nodes report what happens through
//! `NetworkEvent`s on a bounded channel; the driver drains them through
//! `NetworkEvents`. `TopologySnapshot` is the serializable view of the live
//! graph returned by `NetworkExecutor::snapshot`.

use crate::graph::{Link, Network, Node, NodeId, NodeType};
use crate::pipeline::node_executor::NodeStatus;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Events emitted by the network executor and its nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// A node executor was created and set up.
    NodeAdded { node: NodeId, node_type: NodeType },

    /// A node executor was released.
    NodeRemoved { node: NodeId },

    /// A link was wired into a connection.
    LinkAdded { link: Link },

    /// A link was torn down.
    LinkRemoved { link: Link },

    /// A node failed during setup or connect; its outputs carry end-of-stream.
    NodeDegraded { node: NodeId, reason: String },

    /// A node worker reported an asynchronous hardware failure.
    NodeFaulted { node: NodeId, reason: String },

    /// An in-cycle link was drained during teardown.
    CycleDrained {
        link: Link,
        frames_drained: usize,
        eos_received: bool,
    },

    Paused,

    Resumed,

    /// A hot swap finished.
    SwapCompleted {
        removed_links: usize,
        removed_nodes: usize,
        added_nodes: usize,
        added_links: usize,
    },

    /// The network was stopped and every node released.
    Stopped,
}

/// Channel capacity for events (network → driver).
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Create a linked `(sender, events)` pair.
pub fn event_channel() -> (EventSender, NetworkEvents) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, NetworkEvents { rx })
}

/// Sending half held by executors. Never blocks; events are dropped when the
/// driver stops draining.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<NetworkEvent>,
}

impl EventSender {
    /// A sender whose events go nowhere, for nodes built outside a network.
    pub fn detached() -> Self {
        event_channel().0
    }

    pub fn emit(&self, event: NetworkEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event channel full, dropping {:?}", event);
            }
        }
    }
}

/// Driver-side handle for network events.
pub struct NetworkEvents {
    rx: Receiver<NetworkEvent>,
}

impl NetworkEvents {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<NetworkEvent> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<NetworkEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Wait for the first event matching `pred`, discarding others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&NetworkEvent) -> bool,
    ) -> Option<NetworkEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.recv_timeout(remaining)?;
            if pred(&event) {
                return Some(event);
            }
        }
    }
}

/// Serializable view of the running graph.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub resumed: bool,
    pub nodes: Vec<NodeStatus>,
    pub links: Vec<Link>,
}

impl TopologySnapshot {
    pub fn node(&self, id: NodeId) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Rebuild a descriptor of what is live.
    pub fn to_network(&self) -> Network {
        let mut network = Network::new();
        for status in &self.nodes {
            let node = Node::new(status.node_type).with_id(status.id);
            if let Err(e) = network.insert_node_with_id(node) {
                tracing::warn!("Snapshot node {} skipped: {}", status.id, e);
            }
        }
        for link in &self.links {
            if let Err(e) = network.insert_link(link.clone()) {
                tracing::warn!("Snapshot link {} skipped: {}", link, e);
            }
        }
        network
    }
}
