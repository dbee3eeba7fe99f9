//! Network executor: turns a declarative `Network` into live nodes and
//! connections, and keeps the two in step under live mutation.
//!
//! # Architecture
//!
//! The executor owns a `Mailbox<NetworkState>`. Every operation is one task on
//! that mailbox, so mutations of the live node and link maps never interleave
//! and each one runs to completion even when its caller gave up waiting.
//!
//! Bulk operations fan work for independent nodes or links out on scoped
//! threads and join before returning. Links are wired in three phases:
//!
//! 1. Every downstream input is bound to its upstream output's config cell.
//! 2. Every upstream output registers a consumer, resolving its config. A node
//!    whose config depends on its input waits on the upstream cell, which the
//!    upstream resolves concurrently in the same phase.
//! 3. Every downstream input receives its receiver and connects.
//!
//! Hot swap removes stale links, removes stale nodes, adds new nodes, adds new
//! links, in that order. Shutdown removes every link before any node, and
//! drains each in-cycle link until the upstream's end-of-stream arrives.

use crate::config::EngineConfig;
use crate::graph::{GraphDiff, Link, Network, Node, NodeId, PortRef};
use crate::pipeline::bridge::{event_channel, EventSender, NetworkEvent, NetworkEvents, TopologySnapshot};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node_executor::{NodeExecutor, NodeStatus};
use crate::pipeline::payload::Payload;
use crate::pipeline::registry::NodeRegistry;
use crate::pipeline::stream_config::StreamConfig;
use crate::runtime::mailbox::panic_message;
use crate::runtime::{ConsumerId, Inlet, Mailbox};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Top-level operator commands.
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    AddNode(Node),
    RemoveNode(NodeId),
    AddLink(Link),
    RemoveLink(Link),
    Pause,
    Resume,
    /// Hot-swap to a new network description.
    Apply(Network),
    Stop,
}

impl NetworkCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkCommand::AddNode(_) => "add_node",
            NetworkCommand::RemoveNode(_) => "remove_node",
            NetworkCommand::AddLink(_) => "add_link",
            NetworkCommand::RemoveLink(_) => "remove_link",
            NetworkCommand::Pause => "pause",
            NetworkCommand::Resume => "resume",
            NetworkCommand::Apply(_) => "apply",
            NetworkCommand::Stop => "stop",
        }
    }
}

// ── Parallel helpers ──

/// Run `f` for every item on its own scoped thread and collect the results
/// in item order. A panicking item becomes `TaskPanicked`.
fn fan_out<T: Sync, R: Send>(
    label: &str,
    items: &[T],
    f: impl Fn(&T) -> PipelineResult<R> + Sync,
) -> Vec<PipelineResult<R>> {
    if items.len() <= 1 {
        return items.iter().map(&f).collect();
    }
    thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                thread::Builder::new()
                    .name(format!("{}-{}", label, i))
                    .spawn_scoped(scope, move || f(item))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|panic| {
                    Err(PipelineError::TaskPanicked {
                        mailbox: label.to_string(),
                        message: panic_message(&*panic),
                    })
                }),
                Err(e) => Err(PipelineError::Spawn(e)),
            })
            .collect()
    })
}

/// Keep the first error, log the rest.
fn note(first: &mut Option<PipelineError>, result: PipelineResult<()>) {
    if let Err(e) = result {
        match first {
            None => *first = Some(e),
            Some(_) => tracing::warn!("Additional failure: {}", e),
        }
    }
}

fn finish(first: Option<PipelineError>) -> PipelineResult<()> {
    first.map_or(Ok(()), Err)
}

/// Treat "already gone" as success.
fn tolerate_closed<T>(result: PipelineResult<T>) -> PipelineResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_closed() || matches!(e, PipelineError::NodeReleased(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

// ── Nodes ──

/// Linked/in-cycle marks for the ports of `id` declared in `network`.
fn marks_for(network: &Network, id: NodeId) -> Vec<(String, bool)> {
    let mut marks = Vec::new();
    for link in network.links_touching(id) {
        if link.from.node == id {
            marks.push((link.from.port.clone(), link.in_cycle));
        }
        if link.to.node == id {
            marks.push((link.to.port.clone(), link.in_cycle));
        }
    }
    marks
}

/// Build, mark, set up and (if the network runs) resume one node.
///
/// A setup failure leaves the node live but degraded.
fn launch_node(
    registry: &NodeRegistry,
    engine: &Arc<EngineConfig>,
    events: &EventSender,
    node: &Node,
    marks: Vec<(String, bool)>,
    resumed: bool,
) -> PipelineResult<NodeExecutor> {
    let body = registry.create(node)?;
    let exec = NodeExecutor::spawn(node, body, Arc::clone(engine), events.clone())?;

    let prepared = (|| -> PipelineResult<()> {
        if !marks.is_empty() {
            exec.mark_ports(marks)?;
        }
        match exec.setup() {
            Ok(()) => {}
            Err(e @ PipelineError::Setup { .. }) => {
                tracing::warn!("Node {} ({}) is degraded: {}", node.id, node.node_type, e);
            }
            Err(e) => return Err(e),
        }
        if resumed {
            exec.resume()?;
        }
        Ok(())
    })();
    if let Err(e) = prepared {
        let _ = exec.release();
        return Err(e);
    }

    events.emit(NetworkEvent::NodeAdded {
        node: node.id,
        node_type: node.node_type,
    });
    tracing::info!("Added node {} ({})", node.id, node.node_type);
    Ok(exec)
}

/// Pause then release one node.
fn retire_node(exec: &NodeExecutor, events: &EventSender) -> PipelineResult<()> {
    if let Err(e) = tolerate_closed(exec.pause()) {
        tracing::warn!("Pausing node {} before release failed: {}", exec.id(), e);
    }
    exec.release()?;
    events.emit(NetworkEvent::NodeRemoved { node: exec.id() });
    tracing::info!("Removed node {}", exec.id());
    Ok(())
}

// ── Links ──

/// A live link.
struct LinkState {
    link: Link,
    consumer: ConsumerId,
    /// In-cycle links keep a receiver so teardown can drain to end-of-stream.
    drain: Option<Inlet<Payload>>,
}

/// A link being wired by `add_links`.
struct Wiring {
    link: Link,
    up: NodeExecutor,
    down: NodeExecutor,
    inlet: Option<Inlet<Payload>>,
}

impl Wiring {
    fn rollback(&self) {
        if let Some(inlet) = &self.inlet {
            let _ = self.up.remove_consumer(&self.link.from.port, inlet.id());
        }
        let _ = self.down.stop_consumer(&self.link.to.port);
    }

    fn into_state(self) -> PipelineResult<LinkState> {
        let inlet = self
            .inlet
            .ok_or_else(|| PipelineError::UnknownLink(self.link.to_string()))?;
        Ok(LinkState {
            consumer: inlet.id(),
            drain: self.link.in_cycle.then_some(inlet),
            link: self.link,
        })
    }
}

/// Receive from `inlet` until end-of-stream or `timeout`. Returns how many
/// data frames were drained and whether end-of-stream arrived.
fn drain_until_eos(inlet: &Inlet<Payload>, timeout: Duration, poll: Duration) -> (usize, bool) {
    let deadline = Instant::now() + timeout;
    let mut frames = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || inlet.is_disconnected() {
            return (frames, false);
        }
        match inlet.recv_timeout(remaining.min(poll)) {
            Some(frame) if frame.is_end_of_stream() => return (frames, true),
            Some(_) => frames += 1,
            None => {}
        }
    }
}

/// Tear one link down. Returns the drain report for in-cycle links.
fn unwire(
    up: Option<&NodeExecutor>,
    down: Option<&NodeExecutor>,
    state: &LinkState,
    engine: &EngineConfig,
) -> PipelineResult<Option<NetworkEvent>> {
    let link = &state.link;
    let Some(drain) = &state.drain else {
        let upstream = up.map_or(Ok(()), |u| {
            tolerate_closed(u.remove_consumer(&link.from.port, state.consumer))
        });
        let downstream = down.map_or(Ok(()), |d| tolerate_closed(d.stop_consumer(&link.to.port)));
        upstream?;
        downstream?;
        return Ok(None);
    };

    // Quiesce the consumer first so only the network reads the channel.
    if let Some(d) = down {
        tolerate_closed(d.stop_consumer(&link.to.port))?;
    }
    let (finished, (frames_drained, eos_received)) = thread::scope(|scope| {
        let finisher = thread::Builder::new()
            .name(format!("finish-{}", link.from))
            .spawn_scoped(scope, || {
                up.map_or(Ok(()), |u| {
                    tolerate_closed(u.finish_consumer(&link.from.port, state.consumer))
                })
            });
        let drained = drain_until_eos(drain, engine.drain_timeout(), engine.poll_interval());
        let finished = match finisher {
            Ok(handle) => handle.join().unwrap_or_else(|panic| {
                Err(PipelineError::TaskPanicked {
                    mailbox: format!("finish-{}", link.from),
                    message: panic_message(&*panic),
                })
            }),
            Err(e) => Err(PipelineError::Spawn(e)),
        };
        (finished, drained)
    });
    finished?;

    if eos_received {
        tracing::debug!("Cycle link {} drained {} frames", link, frames_drained);
    } else {
        tracing::warn!(
            "Cycle link {} saw no end-of-stream within {:?} ({} frames drained)",
            link,
            engine.drain_timeout(),
            frames_drained
        );
    }
    Ok(Some(NetworkEvent::CycleDrained {
        link: link.clone(),
        frames_drained,
        eos_received,
    }))
}

// ── Mailbox state ──

struct NetworkState {
    registry: NodeRegistry,
    engine: Arc<EngineConfig>,
    /// Mirrors exactly what is live.
    network: Network,
    nodes: BTreeMap<NodeId, NodeExecutor>,
    /// Keyed by input port; an input has at most one link.
    links: BTreeMap<PortRef, LinkState>,
    resumed: bool,
    stopped: bool,
    events: EventSender,
}

impl NetworkState {
    fn node(&self, id: NodeId) -> PipelineResult<&NodeExecutor> {
        self.nodes.get(&id).ok_or(PipelineError::UnknownNode(id))
    }

    fn ensure_running(&self) -> PipelineResult<()> {
        if self.stopped {
            return Err(PipelineError::MailboxClosed("network".to_string()));
        }
        Ok(())
    }

    // ── Nodes ──

    fn add_node(&mut self, node: Node) -> PipelineResult<NodeId> {
        self.ensure_running()?;
        self.add_nodes(vec![node], None)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Abandoned("node was not added".to_string()))
    }

    /// Add nodes in parallel. Ports are marked from `declared` links.
    fn add_nodes(&mut self, nodes: Vec<Node>, declared: Option<&Network>) -> PipelineResult<Vec<NodeId>> {
        let mut next = self.network.next_id().0;
        let mut seen = BTreeSet::new();
        let mut prepared = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            if !node.id.is_valid() {
                node.id = NodeId(next);
            }
            if self.nodes.contains_key(&node.id) || !seen.insert(node.id) {
                return Err(PipelineError::DuplicateNode(node.id));
            }
            next = next.max(node.id.0 + 1);
            let marks = declared.map(|n| marks_for(n, node.id)).unwrap_or_default();
            prepared.push((node, marks));
        }

        let (registry, engine, events, resumed) =
            (&self.registry, &self.engine, &self.events, self.resumed);
        let results = fan_out("add-node", &prepared, |(node, marks)| {
            launch_node(registry, engine, events, node, marks.clone(), resumed)
        });

        let mut first = None;
        let mut ids = Vec::new();
        for ((node, _), result) in prepared.into_iter().zip(results) {
            match result {
                Ok(exec) => {
                    ids.push(node.id);
                    self.nodes.insert(node.id, exec);
                    note(&mut first, self.network.insert_node_with_id(node));
                }
                Err(e) => {
                    tracing::warn!("Adding node {} ({}) failed: {}", node.id, node.node_type, e);
                    note(&mut first, Err(e));
                }
            }
        }
        finish(first).map(|_| ids)
    }

    fn remove_node(&mut self, id: NodeId) -> PipelineResult<()> {
        self.node(id)?;
        self.remove_nodes(vec![id])
    }

    /// Remove nodes in parallel, after every link touching them.
    fn remove_nodes(&mut self, ids: Vec<NodeId>) -> PipelineResult<()> {
        let targets: BTreeSet<NodeId> = ids.into_iter().collect();
        let touching: Vec<PortRef> = self
            .links
            .values()
            .filter(|s| targets.iter().any(|id| s.link.touches(*id)))
            .map(|s| s.link.to.clone())
            .collect();
        let mut first = None;
        note(&mut first, self.remove_links(touching));

        let execs: Vec<NodeExecutor> = targets
            .iter()
            .filter_map(|id| self.nodes.remove(id))
            .collect();
        for exec in &execs {
            self.network.remove_node(exec.id());
        }
        let events = &self.events;
        for result in fan_out("remove-node", &execs, |exec| retire_node(exec, events)) {
            note(&mut first, result);
        }
        finish(first)
    }

    // ── Links ──

    fn add_link(&mut self, link: Link) -> PipelineResult<Link> {
        self.ensure_running()?;
        let link = match self.network.flag_new_links(vec![link.clone()]).pop() {
            Some(flagged) => flagged,
            None => link,
        };
        self.add_links(vec![link.clone()])?;
        Ok(link)
    }

    /// Wire links in three parallel phases.
    fn add_links(&mut self, links: Vec<Link>) -> PipelineResult<()> {
        let mut first = None;
        let mut jobs = Vec::new();
        for link in self.network.flag_new_links(links) {
            if let Err(e) = self.network.insert_link(link.clone()) {
                note(&mut first, Err(e));
                continue;
            }
            let endpoints = self.node(link.from.node).cloned().and_then(|up| {
                self.node(link.to.node).cloned().map(|down| (up, down))
            });
            let (up, down) = match endpoints {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    self.network.remove_link(&link);
                    note(&mut first, Err(e));
                    continue;
                }
            };
            jobs.push(Wiring {
                up,
                down,
                link,
                inlet: None,
            });
        }

        let bound = fan_out("bind", &jobs, |w| {
            let cell = w.up.config_cell(&w.link.from.port)?;
            w.down.bind_upstream(&w.link.to.port, cell, w.link.in_cycle)
        });
        let jobs = self.keep_wired(jobs, bound, &mut first);

        let consumers = fan_out("consume", &jobs, |w| w.up.add_consumer(&w.link.from.port));
        let mut with_inlets = Vec::with_capacity(jobs.len());
        for (mut job, result) in jobs.into_iter().zip(consumers) {
            match result {
                Ok(inlet) => {
                    job.inlet = Some(inlet);
                    with_inlets.push(job);
                }
                Err(e) => self.abandon(job, e, &mut first),
            }
        }

        let started = fan_out("start", &with_inlets, |w| {
            let inlet = w
                .inlet
                .clone()
                .ok_or_else(|| PipelineError::UnknownLink(w.link.to_string()))?;
            w.down.start_consumer(&w.link.to.port, inlet)
        });
        for job in self.keep_wired(with_inlets, started, &mut first) {
            let link = job.link.clone();
            match job.into_state() {
                Ok(state) => {
                    tracing::info!("Added link {}", link);
                    self.events.emit(NetworkEvent::LinkAdded { link: link.clone() });
                    self.links.insert(link.to.clone(), state);
                }
                Err(e) => {
                    self.network.remove_link(&link);
                    note(&mut first, Err(e));
                }
            }
        }
        finish(first)
    }

    fn keep_wired(
        &mut self,
        jobs: Vec<Wiring>,
        results: Vec<PipelineResult<()>>,
        first: &mut Option<PipelineError>,
    ) -> Vec<Wiring> {
        let mut kept = Vec::with_capacity(jobs.len());
        for (job, result) in jobs.into_iter().zip(results) {
            match result {
                Ok(()) => kept.push(job),
                Err(e) => self.abandon(job, e, first),
            }
        }
        kept
    }

    fn abandon(&mut self, job: Wiring, error: PipelineError, first: &mut Option<PipelineError>) {
        tracing::warn!("Wiring {} failed: {}", job.link, error);
        job.rollback();
        self.network.remove_link(&job.link);
        note(first, Err(error));
    }

    fn remove_link(&mut self, link: &Link) -> PipelineResult<()> {
        match self.links.get(&link.to) {
            Some(state) if state.link.from == link.from => self.remove_links(vec![link.to.clone()]),
            _ => Err(PipelineError::UnknownLink(link.to_string())),
        }
    }

    /// Tear down the links feeding `inputs` in parallel.
    fn remove_links(&mut self, inputs: Vec<PortRef>) -> PipelineResult<()> {
        let mut jobs = Vec::with_capacity(inputs.len());
        for input in inputs {
            if let Some(state) = self.links.remove(&input) {
                self.network.remove_link(&state.link);
                let up = self.nodes.get(&state.link.from.node).cloned();
                let down = self.nodes.get(&state.link.to.node).cloned();
                jobs.push((up, down, state));
            }
        }

        let engine = &self.engine;
        let results = fan_out("unlink", &jobs, |(up, down, state)| {
            unwire(up.as_ref(), down.as_ref(), state, engine)
        });

        let mut first = None;
        for ((_, _, state), result) in jobs.iter().zip(results) {
            match result {
                Ok(drained) => {
                    if let Some(event) = drained {
                        self.events.emit(event);
                    }
                }
                Err(e) => {
                    tracing::warn!("Tearing down {} failed: {}", state.link, e);
                    note(&mut first, Err(e));
                }
            }
            tracing::info!("Removed link {}", state.link);
            self.events.emit(NetworkEvent::LinkRemoved {
                link: state.link.clone(),
            });
        }
        finish(first)
    }

    fn remove_all_links(&mut self) -> PipelineResult<()> {
        let inputs: Vec<PortRef> = self.links.keys().cloned().collect();
        self.remove_links(inputs)
    }

    fn remove_all_nodes(&mut self) -> PipelineResult<()> {
        let mut first = None;
        note(&mut first, self.remove_all_links());
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        note(&mut first, self.remove_nodes(ids));
        finish(first)
    }

    // ── Whole network ──

    fn set_running(&mut self, resumed: bool) -> PipelineResult<()> {
        self.ensure_running()?;
        let execs: Vec<NodeExecutor> = self.nodes.values().cloned().collect();
        let results = fan_out(if resumed { "resume" } else { "pause" }, &execs, |exec| {
            if resumed {
                exec.resume()
            } else {
                exec.pause()
            }
        });
        self.resumed = resumed;
        if resumed {
            tracing::info!("Network resumed ({} nodes)", execs.len());
            self.events.emit(NetworkEvent::Resumed);
        } else {
            tracing::info!("Network paused ({} nodes)", execs.len());
            self.events.emit(NetworkEvent::Paused);
        }
        let mut first = None;
        for result in results {
            note(&mut first, result);
        }
        finish(first)
    }

    fn apply(&mut self, target: Network) -> PipelineResult<GraphDiff> {
        self.ensure_running()?;
        let mut target = target;
        target.validate()?;
        if !target.links().any(|l| l.in_cycle) {
            let marked = target.mark_cycle_links();
            if marked > 0 {
                tracing::debug!("Marked {} in-cycle links in swap target", marked);
            }
        }

        let diff = self.network.diff(&target);
        if diff.is_empty() {
            tracing::debug!("Swap target matches the live network");
            return Ok(diff);
        }
        tracing::info!(
            "Swapping graph: -{} links, -{} nodes, +{} nodes, +{} links",
            diff.stale_links.len(),
            diff.stale_nodes.len(),
            diff.new_nodes.len(),
            diff.new_links.len()
        );

        let mut first = None;
        let stale_inputs = diff.stale_links.iter().map(|l| l.to.clone()).collect();
        note(&mut first, self.remove_links(stale_inputs));
        note(&mut first, self.remove_nodes(diff.stale_nodes.clone()));
        note(
            &mut first,
            self.add_nodes(diff.new_nodes.clone(), Some(&target)).map(|_| ()),
        );
        note(&mut first, self.add_links(diff.new_links.clone()));
        *self.network.properties_mut() = target.properties().clone();

        self.events.emit(NetworkEvent::SwapCompleted {
            removed_links: diff.stale_links.len(),
            removed_nodes: diff.stale_nodes.len(),
            added_nodes: diff.new_nodes.len(),
            added_links: diff.new_links.len(),
        });
        finish(first).map(|_| diff)
    }

    fn start(&mut self, network: Network) -> PipelineResult<()> {
        self.apply(network)?;
        self.set_running(true)
    }

    /// Links first, then nodes. Idempotent.
    fn stop(&mut self) -> PipelineResult<()> {
        if self.stopped {
            return Ok(());
        }
        let mut first = None;
        note(&mut first, self.remove_all_links());
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        note(&mut first, self.remove_nodes(ids));
        self.resumed = false;
        self.stopped = true;
        self.events.emit(NetworkEvent::Stopped);
        tracing::info!("Network stopped");
        finish(first)
    }

    fn snapshot(&self) -> TopologySnapshot {
        let execs: Vec<NodeExecutor> = self.nodes.values().cloned().collect();
        let nodes = fan_out("status", &execs, NodeExecutor::status)
            .into_iter()
            .filter_map(|status| match status {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("Node status unavailable: {}", e);
                    None
                }
            })
            .collect();
        TopologySnapshot {
            resumed: self.resumed,
            nodes,
            links: self.links.values().map(|s| s.link.clone()).collect(),
        }
    }

    fn execute(&mut self, command: NetworkCommand) -> PipelineResult<()> {
        match command {
            NetworkCommand::AddNode(node) => self.add_node(node).map(|_| ()),
            NetworkCommand::RemoveNode(id) => self.remove_node(id),
            NetworkCommand::AddLink(link) => self.add_link(link).map(|_| ()),
            NetworkCommand::RemoveLink(link) => self.remove_link(&link),
            NetworkCommand::Pause => self.set_running(false),
            NetworkCommand::Resume => self.set_running(true),
            NetworkCommand::Apply(network) => self.apply(network).map(|_| ()),
            NetworkCommand::Stop => self.stop(),
        }
    }
}

// ── Executor handle ──

/// Handle to a running network. Cloning shares the same network.
#[derive(Clone)]
pub struct NetworkExecutor {
    mailbox: Mailbox<NetworkState>,
    engine: Arc<EngineConfig>,
}

impl std::fmt::Debug for NetworkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkExecutor")
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

impl NetworkExecutor {
    /// Start an empty network. Returns the handle and its event stream.
    pub fn spawn(registry: NodeRegistry, engine: EngineConfig) -> PipelineResult<(Self, NetworkEvents)> {
        let engine = Arc::new(engine);
        let (events_tx, events) = event_channel();
        let state = NetworkState {
            registry,
            engine: Arc::clone(&engine),
            network: Network::new(),
            nodes: BTreeMap::new(),
            links: BTreeMap::new(),
            resumed: false,
            stopped: false,
            events: events_tx,
        };
        let mailbox = Mailbox::spawn_with_shutdown("network", state, |state| {
            if let Err(e) = state.stop() {
                tracing::error!("Network shutdown incomplete: {}", e);
            }
        })?;
        Ok((Self { mailbox, engine }, events))
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Load `network`, add all its nodes and links, then resume.
    pub fn start(&self, network: Network) -> PipelineResult<()> {
        self.mailbox.ask(move |state| state.start(network))
    }

    /// Add one node; an invalid id is replaced by the next free one.
    pub fn add_node(&self, node: Node) -> PipelineResult<NodeId> {
        self.mailbox.ask(move |state| state.add_node(node))
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&self, id: NodeId) -> PipelineResult<()> {
        self.mailbox.ask(move |state| state.remove_node(id))
    }

    /// Wire a link. A link that closes a loop among the live links is marked
    /// in-cycle; the returned link carries the final flag.
    pub fn add_link(&self, link: Link) -> PipelineResult<Link> {
        self.mailbox.ask(move |state| state.add_link(link))
    }

    /// Tear a link down, returning once both ends are quiescent.
    pub fn remove_link(&self, link: &Link) -> PipelineResult<()> {
        let link = link.clone();
        self.mailbox.ask(move |state| state.remove_link(&link))
    }

    pub fn add_all_nodes(&self, nodes: Vec<Node>) -> PipelineResult<Vec<NodeId>> {
        self.mailbox.ask(move |state| {
            state.ensure_running()?;
            state.add_nodes(nodes, None)
        })
    }

    pub fn add_all_links(&self, links: Vec<Link>) -> PipelineResult<()> {
        self.mailbox.ask(move |state| {
            state.ensure_running()?;
            state.add_links(links)
        })
    }

    pub fn remove_all_links(&self) -> PipelineResult<()> {
        self.mailbox.ask(NetworkState::remove_all_links)
    }

    /// Remove every node; any remaining links go first.
    pub fn remove_all_nodes(&self) -> PipelineResult<()> {
        self.mailbox.ask(NetworkState::remove_all_nodes)
    }

    pub fn pause(&self) -> PipelineResult<()> {
        self.mailbox.ask(|state| state.set_running(false))
    }

    pub fn resume(&self) -> PipelineResult<()> {
        self.mailbox.ask(|state| state.set_running(true))
    }

    /// Hot-swap the live graph to `network`.
    pub fn apply(&self, network: Network) -> PipelineResult<GraphDiff> {
        self.mailbox.ask(move |state| state.apply(network))
    }

    /// `apply` with a deadline. On timeout the swap still completes inside
    /// the network; only the caller stops waiting.
    pub fn apply_with_timeout(&self, network: Network, timeout: Duration) -> PipelineResult<GraphDiff> {
        self.mailbox
            .call(move |state| state.apply(network))
            .wait_timeout(timeout)
            .inspect_err(|e| tracing::warn!("Swap abandoned by caller: {}", e))?
    }

    /// Run an operator command to completion.
    pub fn run(&self, command: NetworkCommand) -> PipelineResult<()> {
        if let NetworkCommand::Stop = command {
            return self.stop();
        }
        self.mailbox.ask(move |state| state.execute(command))
    }

    /// Run an operator command, waiting at most `timeout` for it.
    pub fn run_with_timeout(&self, command: NetworkCommand, timeout: Duration) -> PipelineResult<()> {
        let name = command.name();
        self.mailbox
            .call(move |state| state.execute(command))
            .wait_timeout(timeout)
            .inspect_err(|e| tracing::warn!("Command '{}' abandoned: {}", name, e))?
    }

    /// Remove all links, then all nodes, then shut the network down.
    /// Idempotent.
    pub fn stop(&self) -> PipelineResult<()> {
        let result = match self.mailbox.ask(NetworkState::stop) {
            Err(e) if e.is_closed() => Ok(()),
            other => other,
        };
        self.mailbox.shutdown();
        result
    }

    pub fn snapshot(&self) -> PipelineResult<TopologySnapshot> {
        self.mailbox.post_and_wait(|state| state.snapshot())
    }

    /// Handle to a live node.
    pub fn node(&self, id: NodeId) -> PipelineResult<NodeExecutor> {
        self.mailbox.ask(move |state| state.node(id).cloned())
    }

    pub fn node_status(&self, id: NodeId) -> PipelineResult<NodeStatus> {
        self.node(id)?.status()
    }

    pub fn node_config(&self, id: NodeId, port: &str) -> PipelineResult<StreamConfig> {
        self.node(id)?.get_config(port)
    }

    pub fn is_resumed(&self) -> PipelineResult<bool> {
        self.mailbox.post_and_wait(|state| state.resumed)
    }

    /// Description of what is live.
    pub fn descriptor(&self) -> PipelineResult<Network> {
        self.mailbox.post_and_wait(|state| state.network.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use crate::pipeline::nodes::SoftwareGpu;
    use crate::runtime::{Connection, DeviceContext, Message, QueuePolicy};

    fn engine() -> EngineConfig {
        EngineConfig {
            drain_timeout_ms: 500,
            poll_interval_ms: 2,
            ..EngineConfig::default()
        }
    }

    fn network() -> (NetworkExecutor, NetworkEvents, DeviceContext<SoftwareGpu>) {
        let gpu = DeviceContext::spawn("gpu-exec-test", SoftwareGpu::new()).unwrap();
        let registry = NodeRegistry::with_builtins(gpu.clone());
        let (exec, events) = NetworkExecutor::spawn(registry, engine()).unwrap();
        (exec, events, gpu)
    }

    fn link(from: u32, to: u32) -> Link {
        Link::new(PortRef::new(NodeId(from), "out"), PortRef::new(NodeId(to), "in"))
    }

    #[test]
    fn test_fan_out_keeps_order_and_contains_panics() {
        let items = vec![1, 2, 3, 4];
        let results = fan_out("test", &items, |n| {
            if *n == 3 {
                panic!("boom");
            }
            Ok(n * 10)
        });
        assert_eq!(results[0].as_ref().ok(), Some(&10));
        assert_eq!(results[3].as_ref().ok(), Some(&40));
        assert!(matches!(results[2], Err(PipelineError::TaskPanicked { .. })));
    }

    #[test]
    fn test_drain_until_eos() {
        let connection = Connection::<Payload>::new("4.out", QueuePolicy::Unbounded);
        let inlet = connection.add_consumer();
        connection.queue(Message::end_of_stream(Duration::ZERO));
        assert_eq!(
            drain_until_eos(&inlet, Duration::from_millis(100), Duration::from_millis(2)),
            (0, true)
        );
        assert_eq!(
            drain_until_eos(&inlet, Duration::from_millis(10), Duration::from_millis(2)),
            (0, false)
        );
    }

    #[test]
    fn test_add_and_remove_link_tracks_descriptor() {
        let (exec, _events, gpu) = network();
        let source = exec.add_node(Node::new(NodeType::TestPattern)).unwrap();
        let sink = exec.add_node(Node::new(NodeType::FrameSink)).unwrap();
        assert_ne!(source, sink);

        let link = exec.add_link(link(source.0, sink.0)).unwrap();
        assert!(!link.in_cycle);
        assert_eq!(exec.descriptor().unwrap().link_count(), 1);
        assert_eq!(
            exec.node_status(source).unwrap().port("out").unwrap().consumers,
            1
        );

        exec.remove_link(&link).unwrap();
        assert_eq!(exec.descriptor().unwrap().link_count(), 0);
        assert!(matches!(exec.remove_link(&link), Err(PipelineError::UnknownLink(_))));
        exec.stop().unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_structural_errors_fail_synchronously() {
        let (exec, _events, gpu) = network();
        let sink = exec.add_node(Node::new(NodeType::FrameSink)).unwrap();
        assert!(matches!(
            exec.add_link(link(9, sink.0)),
            Err(PipelineError::UnknownNode(NodeId(9)))
        ));
        assert!(matches!(
            exec.add_node(Node::new(NodeType::Camera)),
            Err(PipelineError::UnregisteredNodeType(NodeType::Camera))
        ));
        assert!(matches!(
            exec.remove_node(NodeId(42)),
            Err(PipelineError::UnknownNode(NodeId(42)))
        ));
        assert_eq!(exec.descriptor().unwrap().node_count(), 1);
        exec.stop().unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_live_link_closing_a_loop_is_in_cycle() {
        let (exec, _events, gpu) = network();
        let a = exec.add_node(Node::new(NodeType::Feedback)).unwrap();
        let b = exec.add_node(Node::new(NodeType::Feedback)).unwrap();
        assert!(!exec.add_link(link(a.0, b.0)).unwrap().in_cycle);
        assert!(exec.add_link(link(b.0, a.0)).unwrap().in_cycle);
        assert!(exec.node_status(a).unwrap().port("in").unwrap().in_cycle);
        exec.stop().unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_loop_closed_against_earlier_link_is_in_cycle() {
        let (exec, _events, gpu) = network();
        let a = exec.add_node(Node::new(NodeType::Feedback)).unwrap();
        let b = exec.add_node(Node::new(NodeType::Feedback)).unwrap();
        assert!(!exec.add_link(link(b.0, a.0)).unwrap().in_cycle);
        assert!(exec.add_link(link(a.0, b.0)).unwrap().in_cycle);
        assert!(exec.node_status(b).unwrap().port("in").unwrap().in_cycle);
        assert!(!exec.node_status(a).unwrap().port("in").unwrap().in_cycle);
        exec.stop().unwrap();
        gpu.shutdown();
    }

    #[test]
    fn test_stop_is_idempotent_and_closes_intake() {
        let (exec, events, gpu) = network();
        exec.add_node(Node::new(NodeType::FrameSink)).unwrap();
        exec.stop().unwrap();
        exec.stop().unwrap();
        assert!(exec.add_node(Node::new(NodeType::FrameSink)).unwrap_err().is_closed());
        let stopped = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, NetworkEvent::Stopped))
            .count();
        assert_eq!(stopped, 1);
        gpu.shutdown();
    }
}
