//! Declarative graph: nodes, links and a property table.
//!
//! A `Network` is plain data. The `NetworkExecutor` turns it into live node
//! executors and connections, and `Network::diff` drives hot swaps between two
//! descriptions of the same running graph.

use crate::graph::id::{NodeId, PortRef};
use crate::graph::node::{Link, Node};
use crate::graph::port::PortDirection;
use crate::graph::property::Properties;
use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declarative description of a processing graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NetworkRepr", into = "NetworkRepr")]
pub struct Network {
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeSet<Link>,
    properties: Properties,
}

/// Serialized form: plain lists, validated on the way in.
#[derive(Serialize, Deserialize)]
struct NetworkRepr {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    properties: Properties,
}

impl TryFrom<NetworkRepr> for Network {
    type Error = PipelineError;

    fn try_from(repr: NetworkRepr) -> PipelineResult<Self> {
        let mut network = Network {
            properties: repr.properties,
            ..Network::default()
        };
        for node in repr.nodes {
            network.insert_node_with_id(node)?;
        }
        for link in repr.links {
            network.insert_link(link)?;
        }
        Ok(network)
    }
}

impl From<Network> for NetworkRepr {
    fn from(network: Network) -> Self {
        NetworkRepr {
            nodes: network.nodes.into_values().collect(),
            links: network.links.into_iter().collect(),
            properties: network.properties,
        }
    }
}

/// Changes needed to turn one network into another, in application order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDiff {
    pub stale_links: Vec<Link>,
    pub stale_nodes: Vec<NodeId>,
    pub new_nodes: Vec<Node>,
    pub new_links: Vec<Link>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.stale_links.is_empty()
            && self.stale_nodes.is_empty()
            && self.new_nodes.is_empty()
            && self.new_links.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unseen,
    OnStack,
    Done,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Nodes ──

    /// Next id that `insert_node` would assign.
    pub fn next_id(&self) -> NodeId {
        self.nodes
            .keys()
            .next_back()
            .map(|id| NodeId(id.0 + 1))
            .unwrap_or(NodeId(0))
    }

    /// Insert a node, assigning it a fresh id.
    pub fn insert_node(&mut self, mut node: Node) -> NodeId {
        let id = self.next_id();
        node.id = id;
        self.nodes.insert(id, node);
        id
    }

    /// Insert a node that already carries its id.
    pub fn insert_node_with_id(&mut self, node: Node) -> PipelineResult<()> {
        if !node.id.is_valid() {
            return Err(PipelineError::InvalidLink(format!(
                "node of type {} has no id",
                node.node_type
            )));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(PipelineError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Remove a node together with every link touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.links.retain(|l| !l.touches(id));
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_node_id(&self) -> Option<NodeId> {
        self.nodes.keys().next_back().copied()
    }

    // ── Links ──

    /// Validate a link against the nodes and ports of this network.
    pub fn check_link(&self, link: &Link) -> PipelineResult<()> {
        let from = self
            .nodes
            .get(&link.from.node)
            .ok_or(PipelineError::UnknownNode(link.from.node))?;
        let to = self
            .nodes
            .get(&link.to.node)
            .ok_or(PipelineError::UnknownNode(link.to.node))?;

        let out_port = from.port(&link.from.port).ok_or_else(|| PipelineError::UnknownPort {
            node_id: from.id,
            port: link.from.port.clone(),
        })?;
        let in_port = to.port(&link.to.port).ok_or_else(|| PipelineError::UnknownPort {
            node_id: to.id,
            port: link.to.port.clone(),
        })?;

        if out_port.direction != PortDirection::Output {
            return Err(PipelineError::InvalidLink(format!(
                "{} is not an output port",
                link.from
            )));
        }
        if in_port.direction != PortDirection::Input {
            return Err(PipelineError::InvalidLink(format!(
                "{} is not an input port",
                link.to
            )));
        }
        if out_port.kind != in_port.kind {
            return Err(PipelineError::PortMismatch(format!(
                "{} carries {:?} but {} expects {:?}",
                link.from, out_port.kind, link.to, in_port.kind
            )));
        }
        Ok(())
    }

    /// Insert a validated link. An input port accepts a single link.
    pub fn insert_link(&mut self, link: Link) -> PipelineResult<()> {
        self.check_link(&link)?;
        if let Some(existing) = self.link_into(&link.to) {
            return Err(if existing.from == link.from {
                PipelineError::DuplicateLink(link.to_string())
            } else {
                PipelineError::InvalidLink(format!("{} is already fed by {}", link.to, existing.from))
            });
        }
        self.links.insert(link);
        Ok(())
    }

    /// Link two ports, returning the inserted link.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> PipelineResult<Link> {
        let link = Link::new(from, to);
        self.insert_link(link.clone())?;
        Ok(link)
    }

    pub fn remove_link(&mut self, link: &Link) -> bool {
        self.links.remove(link)
    }

    pub fn contains_link(&self, link: &Link) -> bool {
        self.links.contains(link)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// The link feeding an input port, if any.
    pub fn link_into(&self, port: &PortRef) -> Option<&Link> {
        self.links.iter().find(|l| &l.to == port)
    }

    pub fn links_from<'a>(&'a self, port: &'a PortRef) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| &l.from == port)
    }

    pub fn links_touching(&self, id: NodeId) -> Vec<Link> {
        self.links.iter().filter(|l| l.touches(id)).cloned().collect()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Re-check every link. Fails on the first broken one.
    pub fn validate(&self) -> PipelineResult<()> {
        let mut fed = BTreeSet::new();
        for link in &self.links {
            self.check_link(link)?;
            if !fed.insert(&link.to) {
                return Err(PipelineError::InvalidLink(format!(
                    "{} has more than one incoming link",
                    link.to
                )));
            }
        }
        Ok(())
    }

    // ── Copying and splicing ──

    /// Copy of this network with every node id shifted by `offset`.
    pub fn offset_copy(&self, offset: u32) -> Network {
        let nodes = self
            .nodes
            .values()
            .map(|n| {
                let mut n = n.clone();
                n.id = n.id.offset(offset);
                (n.id, n)
            })
            .collect();
        let links = self.links.iter().map(|l| l.offset(offset)).collect();
        Network {
            nodes,
            links,
            properties: self.properties.clone(),
        }
    }

    /// Splice `other` into this network after shifting its ids past ours.
    /// Returns the offset that was applied.
    pub fn merge(&mut self, other: &Network) -> PipelineResult<u32> {
        let offset = self.next_id().0;
        let copy = other.offset_copy(offset);
        for node in copy.nodes.into_values() {
            self.insert_node_with_id(node)?;
        }
        for link in copy.links {
            self.insert_link(link)?;
        }
        Ok(offset)
    }

    // ── Cycles ──

    /// Recompute every link's `in_cycle` flag.
    ///
    /// A depth-first walk starting from source nodes marks each back edge,
    /// i.e. the link that closes a feedback loop. Returns how many links are
    /// in-cycle afterwards.
    pub fn mark_cycle_links(&mut self) -> usize {
        let mut adjacency: BTreeMap<NodeId, Vec<(PortRef, PortRef)>> = BTreeMap::new();
        let mut has_incoming = BTreeSet::new();
        for link in &self.links {
            adjacency
                .entry(link.from.node)
                .or_default()
                .push((link.from.clone(), link.to.clone()));
            has_incoming.insert(link.to.node);
        }

        let roots: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !has_incoming.contains(*id))
            .chain(self.nodes.keys().filter(|id| has_incoming.contains(*id)))
            .copied()
            .collect();

        let mut visit: BTreeMap<NodeId, Visit> =
            self.nodes.keys().map(|id| (*id, Visit::Unseen)).collect();
        let mut back_edges: BTreeSet<(PortRef, PortRef)> = BTreeSet::new();
        let empty = Vec::new();

        for root in roots {
            if visit.get(&root) != Some(&Visit::Unseen) {
                continue;
            }
            visit.insert(root, Visit::OnStack);
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let edges = adjacency.get(&node).unwrap_or(&empty);
                if top.1 < edges.len() {
                    let (from, to) = &edges[top.1];
                    top.1 += 1;
                    match visit.get(&to.node).copied().unwrap_or(Visit::Done) {
                        Visit::Unseen => {
                            visit.insert(to.node, Visit::OnStack);
                            stack.push((to.node, 0));
                        }
                        Visit::OnStack => {
                            back_edges.insert((from.clone(), to.clone()));
                        }
                        Visit::Done => {}
                    }
                } else {
                    visit.insert(node, Visit::Done);
                    stack.pop();
                }
            }
        }

        let links = std::mem::take(&mut self.links);
        self.links = links
            .into_iter()
            .map(|mut l| {
                l.in_cycle = back_edges.contains(&(l.from.clone(), l.to.clone()));
                l
            })
            .collect();
        back_edges.len()
    }

    /// In-cycle flags for a batch of links about to join this network.
    ///
    /// Links already flagged stay flagged. Of the rest, the back edges a
    /// depth-first walk finds over the merged graph are flagged first, then
    /// any link that would still close a loop of unflagged links. The
    /// unflagged links of the result together with this network's always
    /// form an acyclic graph.
    pub fn flag_new_links(&self, mut batch: Vec<Link>) -> Vec<Link> {
        let mut scratch = self.clone();
        scratch.links.retain(|l| !l.in_cycle);
        scratch
            .links
            .extend(batch.iter().filter(|l| !l.in_cycle).cloned());
        scratch.mark_cycle_links();
        let back_edges: BTreeSet<(PortRef, PortRef)> = scratch
            .links
            .iter()
            .filter(|l| l.in_cycle)
            .map(|l| (l.from.clone(), l.to.clone()))
            .collect();
        for link in batch.iter_mut().filter(|l| !l.in_cycle) {
            link.in_cycle = back_edges.contains(&(link.from.clone(), link.to.clone()));
        }

        let mut acyclic: Vec<(NodeId, NodeId)> = self
            .links
            .iter()
            .filter(|l| !l.in_cycle)
            .map(|l| (l.from.node, l.to.node))
            .collect();
        for link in batch.iter_mut().filter(|l| !l.in_cycle) {
            if reaches(&acyclic, link.to.node, link.from.node) {
                link.in_cycle = true;
            } else {
                acyclic.push((link.from.node, link.to.node));
            }
        }
        batch
    }

    // ── Diffing ──

    /// Changes needed to turn `self` into `target`.
    ///
    /// A node whose type or properties differ is both stale and new, and every
    /// link touching it is re-created. Links are matched by endpoints; where
    /// a loop carries its in-cycle flag does not make a link stale.
    pub fn diff(&self, target: &Network) -> GraphDiff {
        let stale_nodes: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| target.node(n.id) != Some(*n))
            .map(|n| n.id)
            .collect();
        let new_nodes: Vec<Node> = target
            .nodes
            .values()
            .filter(|n| self.node(n.id) != Some(*n))
            .cloned()
            .collect();

        let stale_ids: BTreeSet<NodeId> = stale_nodes.iter().copied().collect();
        let new_ids: BTreeSet<NodeId> = new_nodes.iter().map(|n| n.id).collect();

        let live_ends = endpoints(&self.links);
        let target_ends = endpoints(&target.links);

        let stale_links = self
            .links
            .iter()
            .filter(|l| {
                !target_ends.contains(&(&l.from, &l.to))
                    || stale_ids.contains(&l.from.node)
                    || stale_ids.contains(&l.to.node)
            })
            .cloned()
            .collect();
        let new_links = target
            .links
            .iter()
            .filter(|l| {
                !live_ends.contains(&(&l.from, &l.to))
                    || new_ids.contains(&l.from.node)
                    || new_ids.contains(&l.to.node)
            })
            .cloned()
            .collect();

        GraphDiff {
            stale_links,
            stale_nodes,
            new_nodes,
            new_links,
        }
    }
}

fn endpoints(links: &BTreeSet<Link>) -> BTreeSet<(&PortRef, &PortRef)> {
    links.iter().map(|l| (&l.from, &l.to)).collect()
}

/// Whether `to` can be reached from `from` over `edges`.
fn reaches(edges: &[(NodeId, NodeId)], from: NodeId, to: NodeId) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        stack.extend(
            edges
                .iter()
                .filter(|(a, _)| *a == current)
                .map(|(_, b)| *b),
        );
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node_type::NodeType;

    fn chain() -> (Network, NodeId, NodeId, NodeId) {
        let mut net = Network::new();
        let a = net.insert_node(Node::new(NodeType::TestPattern));
        let b = net.insert_node(Node::new(NodeType::ColorGain));
        let c = net.insert_node(Node::new(NodeType::FrameSink));
        net.connect(PortRef::new(a, "out"), PortRef::new(b, "in")).unwrap();
        net.connect(PortRef::new(b, "out"), PortRef::new(c, "in")).unwrap();
        (net, a, b, c)
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let (net, a, b, c) = chain();
        assert_eq!((a, b, c), (NodeId(0), NodeId(1), NodeId(2)));
        assert_eq!(net.next_id(), NodeId(3));
        assert!(net.validate().is_ok());
    }

    #[test]
    fn test_link_validation() {
        let (mut net, a, b, c) = chain();

        // Output used as input
        let err = net
            .connect(PortRef::new(c, "in"), PortRef::new(a, "out"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLink(_)));

        // Unknown port
        let err = net
            .connect(PortRef::new(a, "audio"), PortRef::new(b, "in"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPort { .. }));

        // Input already fed
        let d = net.insert_node(Node::new(NodeType::TestPattern));
        let err = net
            .connect(PortRef::new(d, "out"), PortRef::new(b, "in"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLink(_)));

        // Same link twice
        let err = net
            .connect(PortRef::new(a, "out"), PortRef::new(b, "in"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateLink(_)));
    }

    #[test]
    fn test_port_kind_mismatch() {
        let mut net = Network::new();
        let mic = net.insert_node(Node::new(NodeType::Microphone));
        let display = net.insert_node(Node::new(NodeType::Display));
        let err = net
            .connect(PortRef::new(mic, "out"), PortRef::new(display, "in"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::PortMismatch(_)));
    }

    #[test]
    fn test_remove_node_drops_touching_links() {
        let (mut net, _a, b, _c) = chain();
        assert!(net.remove_node(b).is_some());
        assert_eq!(net.link_count(), 0);
        assert_eq!(net.node_count(), 2);
    }

    #[test]
    fn test_offset_copy_and_merge() {
        let (mut base, ..) = chain();
        let (effect, ..) = chain();

        let copy = effect.offset_copy(100);
        assert!(copy.contains_node(NodeId(100)));
        assert!(copy
            .links()
            .all(|l| l.from.node.0 >= 100 && l.to.node.0 >= 100));

        let offset = base.merge(&effect).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(base.node_count(), 6);
        assert_eq!(base.link_count(), 4);
        assert!(base.validate().is_ok());
    }

    #[test]
    fn test_mark_cycle_links_self_loop() {
        let mut net = Network::new();
        let ring = net.insert_node(Node::new(NodeType::Feedback));
        net.connect(PortRef::new(ring, "out"), PortRef::new(ring, "in")).unwrap();

        assert_eq!(net.mark_cycle_links(), 1);
        assert!(net.links().all(|l| l.in_cycle));
    }

    #[test]
    fn test_mark_cycle_links_marks_only_back_edge() {
        // a -> b -> a, with b also feeding a sink
        let mut net = Network::new();
        let a = net.insert_node(Node::new(NodeType::Feedback));
        let b = net.insert_node(Node::new(NodeType::Feedback));
        let sink = net.insert_node(Node::new(NodeType::FrameSink));
        net.connect(PortRef::new(a, "out"), PortRef::new(b, "in")).unwrap();
        net.connect(PortRef::new(b, "out"), PortRef::new(a, "in")).unwrap();
        net.connect(PortRef::new(b, "out"), PortRef::new(sink, "in")).unwrap();

        assert_eq!(net.mark_cycle_links(), 1);
        let cyclic: Vec<_> = net.links().filter(|l| l.in_cycle).collect();
        assert_eq!(cyclic.len(), 1);
        assert_eq!(cyclic[0].from, PortRef::new(b, "out"));
        assert_eq!(cyclic[0].to, PortRef::new(a, "in"));
    }

    #[test]
    fn test_mark_cycle_links_acyclic() {
        let (mut net, ..) = chain();
        assert_eq!(net.mark_cycle_links(), 0);
    }

    #[test]
    fn test_diff_replaces_middle_node() {
        let (old, a, b, c) = chain();
        let mut new = old.clone();
        new.remove_node(b);
        let fb = Node::new(NodeType::Feedback).with_id(NodeId(10));
        new.insert_node_with_id(fb).unwrap();
        new.connect(PortRef::new(a, "out"), PortRef::new(NodeId(10), "in")).unwrap();
        new.connect(PortRef::new(NodeId(10), "out"), PortRef::new(c, "in")).unwrap();

        let diff = old.diff(&new);
        assert_eq!(diff.stale_nodes, vec![b]);
        assert_eq!(diff.new_nodes.len(), 1);
        assert_eq!(diff.new_nodes[0].id, NodeId(10));
        assert_eq!(diff.stale_links.len(), 2);
        assert_eq!(diff.new_links.len(), 2);
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn test_diff_changed_properties_recreates_links() {
        let (old, _a, b, _c) = chain();
        let mut new = old.clone();
        new.node_mut(b).unwrap().properties.set("gain", 2.0);

        let diff = old.diff(&new);
        assert_eq!(diff.stale_nodes, vec![b]);
        assert_eq!(diff.new_nodes.len(), 1);
        assert_eq!(diff.stale_links.len(), 2);
        assert_eq!(diff.new_links.len(), 2);
    }

    fn feedback_pair(ids: [u32; 2]) -> Network {
        let mut net = Network::new();
        for id in ids {
            net.insert_node_with_id(Node::new(NodeType::Feedback).with_id(NodeId(id)))
                .unwrap();
        }
        net
    }

    fn feedback_link(from: u32, to: u32) -> Link {
        Link::new(PortRef::new(NodeId(from), "out"), PortRef::new(NodeId(to), "in"))
    }

    #[test]
    fn test_flag_new_links_next_to_flagged_ring() {
        let mut net = feedback_pair([10, 11]);
        net.insert_node_with_id(Node::new(NodeType::Feedback).with_id(NodeId(4)))
            .unwrap();
        net.insert_link(Link::cyclic(
            PortRef::new(NodeId(4), "out"),
            PortRef::new(NodeId(4), "in"),
        ))
        .unwrap();

        let flagged = net.flag_new_links(vec![feedback_link(10, 11), feedback_link(11, 10)]);
        assert_eq!(flagged.iter().filter(|l| l.in_cycle).count(), 1);
        assert!(flagged[1].in_cycle, "back edge of the new loop: {:?}", flagged);
    }

    #[test]
    fn test_flag_new_links_when_live_link_is_the_back_edge() {
        // 11 -> 10 is live and unflagged; 10 -> 11 closes the loop
        let mut net = feedback_pair([10, 11]);
        net.insert_link(feedback_link(11, 10)).unwrap();

        let flagged = net.flag_new_links(vec![feedback_link(10, 11)]);
        assert!(flagged[0].in_cycle);
    }

    #[test]
    fn test_flag_new_links_keeps_acyclic_batch_unflagged() {
        let (mut net, a, ..) = chain();
        let sink = net.insert_node(Node::new(NodeType::FrameSink));
        let flagged = net.flag_new_links(vec![Link::new(
            PortRef::new(a, "out"),
            PortRef::new(sink, "in"),
        )]);
        assert!(!flagged[0].in_cycle);
    }

    #[test]
    fn test_diff_ignores_cycle_flag_placement() {
        let mut live = feedback_pair([5, 6]);
        live.insert_link(feedback_link(6, 5)).unwrap();
        live.insert_link(Link::cyclic(
            PortRef::new(NodeId(5), "out"),
            PortRef::new(NodeId(6), "in"),
        ))
        .unwrap();

        let mut target = feedback_pair([5, 6]);
        target.insert_link(feedback_link(5, 6)).unwrap();
        target.insert_link(feedback_link(6, 5)).unwrap();
        assert_eq!(target.mark_cycle_links(), 1);

        assert!(live.diff(&target).is_empty());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let (net, ..) = chain();
        let json = serde_json::to_string(&net).unwrap();
        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(back, net);

        let broken = r#"{"nodes":[{"id":0,"node_type":"frame_sink"}],
                         "links":[{"from":{"node":0,"port":"out"},"to":{"node":0,"port":"in"}}]}"#;
        assert!(serde_json::from_str::<Network>(broken).is_err());
    }
}
