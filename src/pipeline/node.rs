//! Node abstraction for the graph runtime.
//!
//! Two-layer design:
//! - **`NodeBehavior` trait**: the lifecycle contract every node body
//!   implements, including bodies supplied from outside the crate.
//! - **`BuiltinNode` enum**: the built-in bodies, dispatched by `match`.
//!
//! `AnyNode` wraps either variant so the node executor handles both
//! uniformly. Every hook receives the node's `NodeContext`: its properties,
//! per-port link state, output connections and config cells.

use crate::config::EngineConfig;
use crate::graph::{Node, NodeId, NodeType, PortDescriptor, Properties};
use crate::pipeline::bridge::{EventSender, NetworkEvent};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node_executor::NodeState;
use crate::pipeline::nodes::{ColorGainNode, FeedbackNode, FrameSinkNode, TestPatternNode};
use crate::pipeline::payload::Payload;
use crate::pipeline::stream_config::{ConfigAwait, ConfigCell, StreamConfig};
use crate::runtime::{Connection, Inlet, WeakMailbox};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Context ──

/// Runtime state of one port.
pub struct PortState {
    pub(crate) descriptor: &'static PortDescriptor,
    /// Something is (or is declared to be) attached.
    pub(crate) linked: bool,
    pub(crate) in_cycle: bool,
    /// Output: lazily created connection.
    pub(crate) connection: Option<Connection<Payload>>,
    /// Output: memoized config shared with downstream nodes.
    pub(crate) config: Option<ConfigCell>,
    /// Input: receiving end of the upstream connection.
    pub(crate) inlet: Option<Inlet<Payload>>,
    /// Input: the upstream output's config cell.
    pub(crate) upstream: Option<ConfigCell>,
}

impl PortState {
    fn new(descriptor: &'static PortDescriptor) -> Self {
        Self {
            descriptor,
            linked: false,
            in_cycle: false,
            connection: None,
            config: descriptor.is_output().then(ConfigCell::new),
            inlet: None,
            upstream: None,
        }
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.connection
            .as_ref()
            .map(Connection::consumer_count)
            .unwrap_or(0)
    }

    pub(crate) fn leaky_drops(&self) -> u64 {
        self.connection
            .as_ref()
            .map(|c| c.stats().leaky_drops)
            .unwrap_or(0)
    }
}

/// Context passed to every node lifecycle hook.
pub struct NodeContext {
    id: NodeId,
    node_type: NodeType,
    properties: Properties,
    ports: BTreeMap<&'static str, PortState>,
    engine: Arc<EngineConfig>,
    faults: FaultReporter,
    epoch: Instant,
}

impl NodeContext {
    pub fn new(node: &Node, engine: Arc<EngineConfig>) -> Self {
        let ports = node
            .ports()
            .iter()
            .map(|d| (d.key, PortState::new(d)))
            .collect();
        Self {
            id: node.id,
            node_type: node.node_type,
            properties: node.properties.clone(),
            ports,
            engine,
            faults: FaultReporter::detached(node.id),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn set_fault_reporter(&mut self, faults: FaultReporter) {
        self.faults = faults;
    }

    /// Config cells of every output port.
    pub(crate) fn output_cells(&self) -> BTreeMap<&'static str, ConfigCell> {
        self.ports
            .iter()
            .filter_map(|(key, p)| p.config.clone().map(|cell| (*key, cell)))
            .collect()
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = (&'static str, &PortState)> {
        self.ports.iter().map(|(k, p)| (*k, p))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Time since the node was created; used to stamp end-of-stream.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Handle for reporting asynchronous failures from worker threads.
    pub fn faults(&self) -> FaultReporter {
        self.faults.clone()
    }

    pub(crate) fn port(&self, key: &str) -> PipelineResult<&PortState> {
        self.ports.get(key).ok_or_else(|| PipelineError::UnknownPort {
            node_id: self.id,
            port: key.to_string(),
        })
    }

    pub(crate) fn port_mut(&mut self, key: &str) -> PipelineResult<&mut PortState> {
        let id = self.id;
        self.ports
            .get_mut(key)
            .ok_or_else(|| PipelineError::UnknownPort {
                node_id: id,
                port: key.to_string(),
            })
    }

    pub(crate) fn output_mut(&mut self, key: &str) -> PipelineResult<&mut PortState> {
        let id = self.id;
        let port = self.port_mut(key)?;
        if !port.descriptor.is_output() {
            return Err(PipelineError::PortMismatch(format!("{}.{} is not an output", id, key)));
        }
        Ok(port)
    }

    pub(crate) fn input_mut(&mut self, key: &str) -> PipelineResult<&mut PortState> {
        let id = self.id;
        let port = self.port_mut(key)?;
        if !port.descriptor.is_input() {
            return Err(PipelineError::PortMismatch(format!("{}.{} is not an input", id, key)));
        }
        Ok(port)
    }

    pub fn is_linked(&self, key: &str) -> bool {
        self.ports.get(key).is_some_and(|p| p.linked)
    }

    pub fn is_in_cycle(&self, key: &str) -> bool {
        self.ports.get(key).is_some_and(|p| p.in_cycle)
    }

    pub fn consumer_count(&self, key: &str) -> usize {
        self.ports.get(key).map(PortState::consumer_count).unwrap_or(0)
    }

    /// Output ports that currently have at least one consumer.
    pub fn linked_outputs(&self) -> usize {
        self.ports
            .values()
            .filter(|p| p.descriptor.is_output() && p.consumer_count() > 0)
            .count()
    }

    /// Connection of an output port, created on first access.
    pub fn connection(&mut self, key: &str) -> PipelineResult<Connection<Payload>> {
        let name = format!("{}.{}", self.id, key);
        let policy = self.engine.consumer_queue;
        let port = self.output_mut(key)?;
        Ok(port
            .connection
            .get_or_insert_with(|| Connection::new(name, policy))
            .clone())
    }

    /// Receiving end attached to an input port.
    pub fn inlet(&self, key: &str) -> Option<Inlet<Payload>> {
        self.ports.get(key).and_then(|p| p.inlet.clone())
    }

    /// Memoized config of one of this node's outputs, if resolved.
    pub fn output_config(&self, key: &str) -> Option<StreamConfig> {
        self.ports
            .get(key)
            .and_then(|p| p.config.as_ref())
            .and_then(ConfigCell::get)
    }

    pub fn default_config(&self, key: &str) -> PipelineResult<StreamConfig> {
        Ok(StreamConfig::default_for(self.port(key)?.descriptor.kind))
    }

    /// Upstream config of an input port as an awaitable.
    ///
    /// Never pending for in-cycle or unbound inputs: those resolve to the
    /// upstream's memoized value, or the port kind's default.
    pub fn config_async(&self, key: &str) -> PipelineResult<ConfigAwait> {
        let port = self.port(key)?;
        if !port.descriptor.is_input() {
            return Err(PipelineError::PortMismatch(format!(
                "{}.{} is not an input",
                self.id, key
            )));
        }
        let default = || StreamConfig::default_for(port.descriptor.kind);
        Ok(match &port.upstream {
            None => ConfigAwait::Ready(default()),
            Some(cell) if port.in_cycle => ConfigAwait::Ready(cell.get().unwrap_or_else(default)),
            Some(cell) => match cell.get() {
                Some(config) => ConfigAwait::Ready(config),
                None => ConfigAwait::Pending(cell.clone()),
            },
        })
    }

    /// Upstream config of an input port, waiting at most the configured
    /// config timeout for a non-cyclic upstream.
    pub fn upstream_config(&self, key: &str) -> PipelineResult<StreamConfig> {
        self.config_async(key)?
            .wait_timeout(self.engine.config_timeout())
    }

    /// Send end-of-stream on every output connection.
    pub(crate) fn close_outputs(&mut self) {
        let timestamp = self.elapsed();
        for port in self.ports.values_mut() {
            if !port.descriptor.is_output() {
                continue;
            }
            let name = format!("{}.{}", self.id, port.descriptor.key);
            let policy = self.engine.consumer_queue;
            port.connection
                .get_or_insert_with(|| Connection::new(name, policy))
                .close(timestamp);
        }
    }
}

// ── Faults ──

/// Lets worker threads report asynchronous failures of their node.
///
/// A report emits `NodeFaulted` and degrades the node on its own mailbox.
#[derive(Clone)]
pub struct FaultReporter {
    node: NodeId,
    mailbox: WeakMailbox<NodeState>,
    events: EventSender,
}

impl FaultReporter {
    pub(crate) fn new(node: NodeId, mailbox: WeakMailbox<NodeState>, events: EventSender) -> Self {
        Self {
            node,
            mailbox,
            events,
        }
    }

    /// A reporter attached to nothing, for nodes built outside a network.
    pub fn detached(node: NodeId) -> Self {
        Self::new(node, WeakMailbox::default(), EventSender::detached())
    }

    pub fn report(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Node {} faulted: {}", self.node, reason);
        self.events.emit(NetworkEvent::NodeFaulted {
            node: self.node,
            reason: reason.clone(),
        });
        if let Some(mailbox) = self.mailbox.upgrade() {
            let _ = mailbox.post(move |state| state.degrade(reason));
        }
    }
}

// ── Behavior ──

/// Lifecycle contract implemented by every node body.
///
/// All hooks run on the node's mailbox thread, one at a time. A body that
/// needs to produce or consume continuously starts a `Worker` from
/// `on_connect` and stops it from `on_disconnect`/`release`.
pub trait NodeBehavior: Send {
    /// Human-readable name of this node body.
    fn name(&self) -> &'static str;

    /// One-time initialization that does not depend on peers.
    fn setup(&mut self, _ctx: &mut NodeContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Compute the config of an output port. Called at most once per port.
    fn make_config(&mut self, ctx: &mut NodeContext, port: &str) -> PipelineResult<StreamConfig> {
        ctx.default_config(port)
    }

    /// A link attached at `port`. `producer_side` is true for outputs.
    fn on_connect(
        &mut self,
        _ctx: &mut NodeContext,
        _port: &str,
        _producer_side: bool,
    ) -> PipelineResult<()> {
        Ok(())
    }

    /// A link detached at `port`. For outputs this fires once the last
    /// consumer is gone.
    fn on_disconnect(&mut self, _ctx: &mut NodeContext, _port: &str, _producer_side: bool) {}

    fn resume(&mut self, _ctx: &mut NodeContext) {}

    fn pause(&mut self, _ctx: &mut NodeContext) {}

    /// Stop all activity and free owned resources.
    fn release(&mut self, _ctx: &mut NodeContext) {}
}

/// Enum dispatch for built-in nodes.
pub enum BuiltinNode {
    TestPattern(TestPatternNode),
    ColorGain(ColorGainNode),
    FrameSink(FrameSinkNode),
    Feedback(FeedbackNode),
}

impl BuiltinNode {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinNode::TestPattern(n) => n.name(),
            BuiltinNode::ColorGain(n) => n.name(),
            BuiltinNode::FrameSink(n) => n.name(),
            BuiltinNode::Feedback(n) => n.name(),
        }
    }

    pub fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        match self {
            BuiltinNode::TestPattern(n) => n.setup(ctx),
            BuiltinNode::ColorGain(n) => n.setup(ctx),
            BuiltinNode::FrameSink(n) => n.setup(ctx),
            BuiltinNode::Feedback(n) => n.setup(ctx),
        }
    }

    pub fn make_config(&mut self, ctx: &mut NodeContext, port: &str) -> PipelineResult<StreamConfig> {
        match self {
            BuiltinNode::TestPattern(n) => n.make_config(ctx, port),
            BuiltinNode::ColorGain(n) => n.make_config(ctx, port),
            BuiltinNode::FrameSink(n) => n.make_config(ctx, port),
            BuiltinNode::Feedback(n) => n.make_config(ctx, port),
        }
    }

    pub fn on_connect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        producer_side: bool,
    ) -> PipelineResult<()> {
        match self {
            BuiltinNode::TestPattern(n) => n.on_connect(ctx, port, producer_side),
            BuiltinNode::ColorGain(n) => n.on_connect(ctx, port, producer_side),
            BuiltinNode::FrameSink(n) => n.on_connect(ctx, port, producer_side),
            BuiltinNode::Feedback(n) => n.on_connect(ctx, port, producer_side),
        }
    }

    pub fn on_disconnect(&mut self, ctx: &mut NodeContext, port: &str, producer_side: bool) {
        match self {
            BuiltinNode::TestPattern(n) => n.on_disconnect(ctx, port, producer_side),
            BuiltinNode::ColorGain(n) => n.on_disconnect(ctx, port, producer_side),
            BuiltinNode::FrameSink(n) => n.on_disconnect(ctx, port, producer_side),
            BuiltinNode::Feedback(n) => n.on_disconnect(ctx, port, producer_side),
        }
    }

    pub fn resume(&mut self, ctx: &mut NodeContext) {
        match self {
            BuiltinNode::TestPattern(n) => n.resume(ctx),
            BuiltinNode::ColorGain(n) => n.resume(ctx),
            BuiltinNode::FrameSink(n) => n.resume(ctx),
            BuiltinNode::Feedback(n) => n.resume(ctx),
        }
    }

    pub fn pause(&mut self, ctx: &mut NodeContext) {
        match self {
            BuiltinNode::TestPattern(n) => n.pause(ctx),
            BuiltinNode::ColorGain(n) => n.pause(ctx),
            BuiltinNode::FrameSink(n) => n.pause(ctx),
            BuiltinNode::Feedback(n) => n.pause(ctx),
        }
    }

    pub fn release(&mut self, ctx: &mut NodeContext) {
        match self {
            BuiltinNode::TestPattern(n) => n.release(ctx),
            BuiltinNode::ColorGain(n) => n.release(ctx),
            BuiltinNode::FrameSink(n) => n.release(ctx),
            BuiltinNode::Feedback(n) => n.release(ctx),
        }
    }
}

/// Wrapper that holds either a built-in node (enum dispatch) or a plugin
/// (trait object).
pub enum AnyNode {
    Builtin(BuiltinNode),
    Plugin(Box<dyn NodeBehavior>),
}

impl AnyNode {
    pub fn plugin(body: impl NodeBehavior + 'static) -> Self {
        AnyNode::Plugin(Box::new(body))
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnyNode::Builtin(n) => n.name(),
            AnyNode::Plugin(n) => n.name(),
        }
    }

    pub fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.setup(ctx),
            AnyNode::Plugin(n) => n.setup(ctx),
        }
    }

    pub fn make_config(&mut self, ctx: &mut NodeContext, port: &str) -> PipelineResult<StreamConfig> {
        match self {
            AnyNode::Builtin(n) => n.make_config(ctx, port),
            AnyNode::Plugin(n) => n.make_config(ctx, port),
        }
    }

    pub fn on_connect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        producer_side: bool,
    ) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_connect(ctx, port, producer_side),
            AnyNode::Plugin(n) => n.on_connect(ctx, port, producer_side),
        }
    }

    pub fn on_disconnect(&mut self, ctx: &mut NodeContext, port: &str, producer_side: bool) {
        match self {
            AnyNode::Builtin(n) => n.on_disconnect(ctx, port, producer_side),
            AnyNode::Plugin(n) => n.on_disconnect(ctx, port, producer_side),
        }
    }

    pub fn resume(&mut self, ctx: &mut NodeContext) {
        match self {
            AnyNode::Builtin(n) => n.resume(ctx),
            AnyNode::Plugin(n) => n.resume(ctx),
        }
    }

    pub fn pause(&mut self, ctx: &mut NodeContext) {
        match self {
            AnyNode::Builtin(n) => n.pause(ctx),
            AnyNode::Plugin(n) => n.pause(ctx),
        }
    }

    pub fn release(&mut self, ctx: &mut NodeContext) {
        match self {
            AnyNode::Builtin(n) => n.release(ctx),
            AnyNode::Plugin(n) => n.release(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PortKind;

    fn ctx_for(node_type: NodeType) -> NodeContext {
        let node = Node::new(node_type).with_id(NodeId(1));
        NodeContext::new(&node, Arc::new(EngineConfig::default()))
    }

    #[test]
    fn test_ports_created_from_template() {
        let ctx = ctx_for(NodeType::ShaderFilter);
        assert_eq!(ctx.ports().count(), 4);
        assert_eq!(ctx.output_cells().len(), 1);
        assert!(!ctx.is_linked("in"));
    }

    #[test]
    fn test_connection_is_lazy_and_output_only() {
        let mut ctx = ctx_for(NodeType::ColorGain);
        assert!(ctx.port("out").unwrap().connection.is_none());

        let a = ctx.connection("out").unwrap();
        let b = ctx.connection("out").unwrap();
        let _inlet = a.add_consumer();
        assert_eq!(b.consumer_count(), 1);
        assert_eq!(a.name(), "1.out");

        assert!(matches!(ctx.connection("in"), Err(PipelineError::PortMismatch(_))));
        assert!(matches!(ctx.connection("lut"), Err(PipelineError::UnknownPort { .. })));
    }

    #[test]
    fn test_unbound_input_resolves_to_default() {
        let ctx = ctx_for(NodeType::ColorGain);
        let config = ctx.upstream_config("in").unwrap();
        assert_eq!(config, StreamConfig::default_for(PortKind::Video));
    }

    #[test]
    fn test_in_cycle_input_never_pending() {
        let mut ctx = ctx_for(NodeType::Feedback);
        let upstream = ConfigCell::new();
        {
            let port = ctx.input_mut("in").unwrap();
            port.upstream = Some(upstream.clone());
            port.in_cycle = true;
        }
        assert!(ctx.config_async("in").unwrap().is_ready());

        // Non-cyclic unresolved upstream is pending
        ctx.input_mut("in").unwrap().in_cycle = false;
        assert!(matches!(ctx.config_async("in").unwrap(), ConfigAwait::Pending(_)));

        upstream.resolve(StreamConfig::Matrix);
        assert_eq!(ctx.upstream_config("in").unwrap(), StreamConfig::Matrix);
    }

    #[test]
    fn test_close_outputs_reaches_consumers() {
        let mut ctx = ctx_for(NodeType::TestPattern);
        let inlet = ctx.connection("out").unwrap().add_consumer();
        ctx.close_outputs();
        assert!(inlet.try_recv().unwrap().is_end_of_stream());
    }

    #[test]
    fn test_detached_fault_reporter_is_harmless() {
        FaultReporter::detached(NodeId(1)).report("camera unplugged");
    }
}
