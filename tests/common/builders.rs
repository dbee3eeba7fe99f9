//! Test data builders for networks, registries and running harnesses

use mediagraph::config::EngineConfig;
use mediagraph::graph::{Link, Network, Node, NodeId, NodeType, PortRef};
use mediagraph::pipeline::nodes::{CaptureMonitor, FrameSinkNode, SinkLog, SoftwareGpu, TestPatternNode};
use mediagraph::pipeline::{AnyNode, BuiltinNode, NetworkEvents, NetworkExecutor, NodeRegistry};
use mediagraph::runtime::DeviceContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// `node.port` shorthand.
pub fn port(node: u32, key: &str) -> PortRef {
    PortRef::new(NodeId(node), key)
}

/// Engine tuned for tests: fast polling, short waits.
pub fn test_engine() -> EngineConfig {
    EngineConfig {
        config_timeout_ms: 500,
        drain_timeout_ms: 1_000,
        poll_interval_ms: 2,
        ..EngineConfig::default()
    }
}

/// Builder for network descriptions with fixed ids.
#[derive(Default)]
pub struct NetworkBuilder {
    network: Network,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(self, id: u32, node_type: NodeType) -> Self {
        self.node_with(Node::new(node_type).with_id(NodeId(id)))
    }

    pub fn node_with(mut self, node: Node) -> Self {
        self.network
            .insert_node_with_id(node)
            .unwrap_or_else(|e| panic!("bad test node: {}", e));
        self
    }

    /// `from.out -> to.in`
    pub fn link(self, from: u32, to: u32) -> Self {
        self.insert(Link::new(port(from, "out"), port(to, "in")))
    }

    /// `from.out -> to.in`, marked in-cycle.
    pub fn cycle(self, from: u32, to: u32) -> Self {
        self.insert(Link::cyclic(port(from, "out"), port(to, "in")))
    }

    pub fn insert(mut self, link: Link) -> Self {
        self.network
            .insert_link(link)
            .unwrap_or_else(|e| panic!("bad test link: {}", e));
        self
    }

    pub fn build(self) -> Network {
        self.network
    }
}

/// Observation handles for nodes built by `tapped_registry`, keyed by node id.
#[derive(Clone, Default)]
pub struct Taps {
    sinks: Arc<Mutex<HashMap<NodeId, SinkLog>>>,
    cameras: Arc<Mutex<HashMap<NodeId, CaptureMonitor>>>,
}

impl Taps {
    pub fn sink(&self, id: u32) -> SinkLog {
        self.sinks
            .lock()
            .unwrap()
            .entry(NodeId(id))
            .or_default()
            .clone()
    }

    pub fn camera(&self, id: u32) -> CaptureMonitor {
        self.cameras
            .lock()
            .unwrap()
            .entry(NodeId(id))
            .or_default()
            .clone()
    }
}

/// Built-in registry whose sinks and test patterns report into `taps`.
pub fn tapped_registry(gpu: DeviceContext<SoftwareGpu>, taps: &Taps) -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins(gpu);
    let sinks = taps.clone();
    registry.register(NodeType::FrameSink, move |node| {
        let log = sinks.sink(node.id.0);
        Ok(AnyNode::Builtin(BuiltinNode::FrameSink(FrameSinkNode::with_log(log))))
    });
    let cameras = taps.clone();
    registry.register(NodeType::TestPattern, move |node| {
        let monitor = cameras.camera(node.id.0);
        Ok(AnyNode::Builtin(BuiltinNode::TestPattern(
            TestPatternNode::new().with_monitor(monitor),
        )))
    });
    registry
}

/// A running network with its GPU context. Stops both on drop.
pub struct Harness {
    pub network: NetworkExecutor,
    pub events: NetworkEvents,
    pub taps: Taps,
    pub gpu: DeviceContext<SoftwareGpu>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(|registry| registry)
    }

    /// Harness whose registry is post-processed by `customize`.
    pub fn with_registry(customize: impl FnOnce(NodeRegistry) -> NodeRegistry) -> Self {
        Self::with_engine(test_engine(), customize)
    }

    pub fn with_engine(
        engine: EngineConfig,
        customize: impl FnOnce(NodeRegistry) -> NodeRegistry,
    ) -> Self {
        super::init_tracing();
        let gpu = DeviceContext::spawn("gpu-test", SoftwareGpu::new()).unwrap();
        let taps = Taps::default();
        let registry = customize(tapped_registry(gpu.clone(), &taps));
        let (network, events) = NetworkExecutor::spawn(registry, engine).unwrap();
        Self {
            network,
            events,
            taps,
            gpu,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.network.stop();
        self.gpu.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_builder() {
        let network = NetworkBuilder::new()
            .node(4, NodeType::Feedback)
            .cycle(4, 4)
            .build();
        assert_eq!(network.node_count(), 1);
        assert!(network.links().all(|l| l.in_cycle));
    }
}
