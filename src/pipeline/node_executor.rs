//! Node executor: the lifecycle wrapper around one node body.
//!
//! # Architecture
//!
//! Each node runs on its own `Mailbox<NodeState>`. Every lifecycle hook of the
//! body executes as a task on that mailbox, so hooks never overlap and the
//! body needs no locking of its own.
//!
//! ```text
//! Created ─setup─▶ Setup ─resume─▶ Resumed ⇄ Paused ─release─▶ Released
//!                    │  per port: connected / disconnected
//! ```
//!
//! Output configs are memoized in `ConfigCell`s that live outside the mailbox.
//! A downstream node waits on the cell directly instead of posting to this
//! node, so two nodes negotiating configs never wait on each other's mailbox.
//!
//! A body that fails `setup`, `make_config` or `on_connect`, or that reports a
//! fault from a worker thread, degrades the node: its outputs are closed with
//! end-of-stream and further hooks are skipped until `release`.

use crate::config::EngineConfig;
use crate::graph::{Node, NodeId, NodeType, PortDirection, PortKind};
use crate::pipeline::bridge::{EventSender, NetworkEvent};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{AnyNode, FaultReporter, NodeContext};
use crate::pipeline::payload::Payload;
use crate::pipeline::stream_config::{ConfigAwait, ConfigCell, StreamConfig};
use crate::runtime::{ConsumerId, Inlet, Mailbox};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle state of a node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Setup,
    Paused,
    Resumed,
    Released,
}

/// Link state of one port, as reported by `NodeExecutor::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortStatus {
    pub key: &'static str,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub linked: bool,
    pub in_cycle: bool,
    /// Registered consumers (outputs only).
    pub consumers: usize,
    /// Frames a leaky consumer queue dropped (outputs only).
    pub leaky_drops: u64,
}

/// Point-in-time view of a node executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub node_type: NodeType,
    pub body: &'static str,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    pub ports: Vec<PortStatus>,
}

impl NodeStatus {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn port(&self, key: &str) -> Option<&PortStatus> {
        self.ports.iter().find(|p| p.key == key)
    }
}

// ── Mailbox state ──

/// State owned by a node's mailbox thread.
pub struct NodeState {
    body: AnyNode,
    ctx: NodeContext,
    lifecycle: Lifecycle,
    degraded: Option<String>,
    events: EventSender,
}

impl NodeState {
    /// Whether hooks of the body may still run.
    fn is_live(&self) -> bool {
        self.degraded.is_none() && self.lifecycle != Lifecycle::Released
    }

    fn ensure_not_released(&self) -> PipelineResult<()> {
        if self.lifecycle == Lifecycle::Released {
            return Err(PipelineError::NodeReleased(self.ctx.id()));
        }
        Ok(())
    }

    /// Stop producing: close every output with end-of-stream and skip
    /// further hooks. The first reason wins.
    pub(crate) fn degrade(&mut self, reason: String) {
        if !self.is_live() {
            return;
        }
        tracing::warn!("Node {} ({}) degraded: {}", self.ctx.id(), self.body.name(), reason);
        self.body.pause(&mut self.ctx);
        self.ctx.close_outputs();
        self.events.emit(NetworkEvent::NodeDegraded {
            node: self.ctx.id(),
            reason: reason.clone(),
        });
        self.degraded = Some(reason);
    }

    fn setup(&mut self) -> PipelineResult<()> {
        self.ensure_not_released()?;
        if self.lifecycle != Lifecycle::Created {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Setup;
        if let Err(e) = self.body.setup(&mut self.ctx) {
            let message = e.to_string();
            self.degrade(format!("setup failed: {}", message));
            return Err(PipelineError::Setup {
                node_id: self.ctx.id(),
                message,
            });
        }
        tracing::debug!("Node {} ({}) set up", self.ctx.id(), self.body.name());
        Ok(())
    }

    /// Memoized config of an output port.
    fn config(&mut self, port: &str) -> PipelineResult<StreamConfig> {
        let cell = self
            .ctx
            .output_mut(port)?
            .config
            .clone()
            .ok_or_else(|| PipelineError::PortMismatch(format!("{}.{} has no config", self.ctx.id(), port)))?;
        if let Some(config) = cell.get() {
            return Ok(config);
        }
        let config = if self.is_live() {
            match self.body.make_config(&mut self.ctx, port) {
                Ok(config) => config,
                Err(e) => {
                    self.degrade(format!("config of '{}' failed: {}", port, e));
                    self.ctx.default_config(port)?
                }
            }
        } else {
            self.ctx.default_config(port)?
        };
        tracing::debug!("Node {} resolved '{}' config: {:?}", self.ctx.id(), port, config);
        Ok(cell.resolve(config))
    }

    fn connect(&mut self, port: &str, producer_side: bool) {
        if !self.is_live() {
            return;
        }
        if let Err(e) = self.body.on_connect(&mut self.ctx, port, producer_side) {
            self.degrade(format!("connect of '{}' failed: {}", port, e));
        }
    }

    fn disconnect(&mut self, port: &str, producer_side: bool) {
        if self.is_live() {
            self.body.on_disconnect(&mut self.ctx, port, producer_side);
        }
    }

    fn add_consumer(&mut self, port: &str) -> PipelineResult<Inlet<Payload>> {
        self.ensure_not_released()?;
        self.config(port)?;
        let inlet = self.ctx.connection(port)?.add_consumer();
        self.ctx.output_mut(port)?.linked = true;
        tracing::debug!("Node {} '{}' gained consumer {}", self.ctx.id(), port, inlet.id());
        self.connect(port, true);
        Ok(inlet)
    }

    /// Unregister a consumer; the producer side disconnects with the last one.
    fn drop_consumer(&mut self, port: &str, id: ConsumerId, finish: bool) -> PipelineResult<bool> {
        let timestamp = self.ctx.elapsed();
        let connection = self.ctx.connection(port)?;
        let removed = if finish {
            connection.finish_consumer(id, timestamp)
        } else {
            connection.remove_consumer(id)
        };
        if removed && connection.consumer_count() == 0 {
            self.ctx.output_mut(port)?.linked = false;
            self.disconnect(port, true);
        }
        Ok(removed)
    }

    fn start_consumer(&mut self, port: &str, inlet: Inlet<Payload>) -> PipelineResult<()> {
        self.ensure_not_released()?;
        let state = self.ctx.input_mut(port)?;
        state.inlet = Some(inlet);
        state.linked = true;
        self.connect(port, false);
        Ok(())
    }

    fn stop_consumer(&mut self, port: &str) -> PipelineResult<()> {
        self.ctx.input_mut(port)?;
        self.disconnect(port, false);
        let state = self.ctx.input_mut(port)?;
        state.inlet = None;
        state.upstream = None;
        state.linked = false;
        state.in_cycle = false;
        Ok(())
    }

    fn set_running(&mut self, resumed: bool) -> PipelineResult<()> {
        self.ensure_not_released()?;
        if self.is_live() {
            if resumed {
                self.body.resume(&mut self.ctx);
            } else {
                self.body.pause(&mut self.ctx);
            }
        }
        self.lifecycle = if resumed {
            Lifecycle::Resumed
        } else {
            Lifecycle::Paused
        };
        Ok(())
    }

    /// Runs at most once, from `release` or from mailbox shutdown.
    fn release(&mut self) {
        if self.lifecycle == Lifecycle::Released {
            return;
        }
        self.body.release(&mut self.ctx);
        self.ctx.close_outputs();
        self.lifecycle = Lifecycle::Released;
        tracing::debug!("Node {} ({}) released", self.ctx.id(), self.body.name());
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.ctx.id(),
            node_type: self.ctx.node_type(),
            body: self.body.name(),
            lifecycle: self.lifecycle,
            degraded: self.degraded.clone(),
            ports: self
                .ctx
                .ports()
                .map(|(key, p)| PortStatus {
                    key,
                    direction: p.descriptor.direction,
                    kind: p.descriptor.kind,
                    linked: p.linked,
                    in_cycle: p.in_cycle,
                    consumers: p.consumer_count(),
                    leaky_drops: p.leaky_drops(),
                })
                .collect(),
        }
    }
}

// ── Executor handle ──

/// Handle to a running node. Cloning shares the same node.
#[derive(Clone)]
pub struct NodeExecutor {
    id: NodeId,
    node_type: NodeType,
    mailbox: Mailbox<NodeState>,
    outputs: Arc<BTreeMap<&'static str, ConfigCell>>,
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .finish()
    }
}

impl NodeExecutor {
    /// Start the mailbox for `node` running `body`. The node is `Created`;
    /// call `setup` next.
    pub fn spawn(
        node: &Node,
        body: AnyNode,
        engine: Arc<EngineConfig>,
        events: EventSender,
    ) -> PipelineResult<Self> {
        let ctx = NodeContext::new(node, engine);
        let outputs = Arc::new(ctx.output_cells());
        let state = NodeState {
            body,
            ctx,
            lifecycle: Lifecycle::Created,
            degraded: None,
            events: events.clone(),
        };
        let mailbox =
            Mailbox::spawn_with_shutdown(format!("node-{}", node.id), state, NodeState::release)?;

        let faults = FaultReporter::new(node.id, mailbox.downgrade(), events);
        mailbox.post(move |state| state.ctx.set_fault_reporter(faults))?;

        Ok(Self {
            id: node.id,
            node_type: node.node_type,
            mailbox,
            outputs,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_released(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// One-time initialization. A failure degrades the node and is returned
    /// as `PipelineError::Setup`.
    pub fn setup(&self) -> PipelineResult<()> {
        self.mailbox.ask(NodeState::setup)
    }

    /// Mark ports as linked ahead of wiring, with their in-cycle flags.
    pub fn mark_ports(&self, ports: Vec<(String, bool)>) -> PipelineResult<()> {
        self.mailbox.ask(move |state| {
            for (key, in_cycle) in ports {
                let port = state.ctx.port_mut(&key)?;
                port.linked = true;
                port.in_cycle = in_cycle;
            }
            Ok(())
        })
    }

    /// Attach the config cell of the upstream output feeding `port`.
    pub fn bind_upstream(&self, port: &str, upstream: ConfigCell, in_cycle: bool) -> PipelineResult<()> {
        let port = port.to_string();
        self.mailbox.ask(move |state| {
            let input = state.ctx.input_mut(&port)?;
            input.upstream = Some(upstream);
            input.in_cycle = in_cycle;
            input.linked = true;
            Ok(())
        })
    }

    /// Register a consumer on an output port, resolving its config first.
    /// Fires the producer-side `on_connect`.
    pub fn add_consumer(&self, port: &str) -> PipelineResult<Inlet<Payload>> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.add_consumer(&port))
    }

    /// Unregister a consumer. Returns whether it was registered.
    pub fn remove_consumer(&self, port: &str, id: ConsumerId) -> PipelineResult<bool> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.drop_consumer(&port, id, false))
    }

    /// Send end-of-stream to one consumer, then unregister it.
    pub fn finish_consumer(&self, port: &str, id: ConsumerId) -> PipelineResult<bool> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.drop_consumer(&port, id, true))
    }

    /// Hand an upstream receiver to an input port. Fires the consumer-side
    /// `on_connect`.
    pub fn start_consumer(&self, port: &str, inlet: Inlet<Payload>) -> PipelineResult<()> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.start_consumer(&port, inlet))
    }

    /// Run the consumer-side `on_disconnect`, then drop the port's receiver.
    /// Returns once the port is quiescent.
    pub fn stop_consumer(&self, port: &str) -> PipelineResult<()> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.stop_consumer(&port))
    }

    pub fn resume(&self) -> PipelineResult<()> {
        self.mailbox.ask(|state| state.set_running(true))
    }

    pub fn pause(&self) -> PipelineResult<()> {
        self.mailbox.ask(|state| state.set_running(false))
    }

    /// Stop the body, close outputs with end-of-stream and shut the mailbox
    /// down. Calling it again is a no-op.
    pub fn release(&self) -> PipelineResult<()> {
        match self.mailbox.post_and_wait(NodeState::release) {
            Ok(()) => {}
            Err(e) if e.is_closed() => return Ok(()),
            Err(e) => tracing::error!("Node {} release failed: {}", self.id, e),
        }
        self.mailbox.shutdown();
        Ok(())
    }

    /// Memoized config of an output port, computing it on first request.
    pub fn get_config(&self, port: &str) -> PipelineResult<StreamConfig> {
        if let Some(config) = self.outputs.get(port).and_then(ConfigCell::get) {
            return Ok(config);
        }
        let port = port.to_string();
        self.mailbox.ask(move |state| state.config(&port))
    }

    /// Upstream config of an input port. Never pending for in-cycle inputs.
    pub fn config_async(&self, port: &str) -> PipelineResult<ConfigAwait> {
        let port = port.to_string();
        self.mailbox.ask(move |state| state.ctx.config_async(&port))
    }

    /// Shared config cell of an output port.
    pub fn config_cell(&self, port: &str) -> PipelineResult<ConfigCell> {
        self.outputs
            .get(port)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPort {
                node_id: self.id,
                port: port.to_string(),
            })
    }

    pub fn status(&self) -> PipelineResult<NodeStatus> {
        self.mailbox.post_and_wait(|state| state.status())
    }

    /// Degrade the node asynchronously.
    pub fn degrade(&self, reason: impl Into<String>) -> PipelineResult<()> {
        let reason = reason.into();
        self.mailbox.post(move |state| state.degrade(reason))
    }
}
