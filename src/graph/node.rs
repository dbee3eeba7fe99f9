//! Node and link descriptors.

use crate::graph::id::{NodeId, PortRef};
use crate::graph::node_type::NodeType;
use crate::graph::port::PortDescriptor;
use crate::graph::property::{Properties, PropertyValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A declared unit of processing in a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// `NodeId::INVALID` until the node is inserted into a `Network`.
    #[serde(default = "invalid_id")]
    pub id: NodeId,
    pub node_type: NodeType,
    #[serde(default)]
    pub properties: Properties,
}

fn invalid_id() -> NodeId {
    NodeId::INVALID
}

impl Node {
    /// Construct a node from its type template.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            id: NodeId::INVALID,
            node_type,
            properties: Properties::new(),
        }
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn ports(&self) -> &'static [PortDescriptor] {
        self.node_type.ports()
    }

    pub fn port(&self, key: &str) -> Option<&'static PortDescriptor> {
        self.node_type.port(key)
    }

    pub fn port_ref(&self, key: &str) -> PortRef {
        PortRef::new(self.id, key)
    }
}

/// Directed edge between two ports.
///
/// `in_cycle` marks the edge that closes a feedback loop; the runtime never
/// blocks on configuration flowing over it and drains it until end-of-stream
/// on teardown.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub from: PortRef,
    pub to: PortRef,
    #[serde(default)]
    pub in_cycle: bool,
}

impl Link {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self {
            from,
            to,
            in_cycle: false,
        }
    }

    pub fn cyclic(from: PortRef, to: PortRef) -> Self {
        Self {
            from,
            to,
            in_cycle: true,
        }
    }

    /// Whether either endpoint sits on `node`.
    pub fn touches(&self, node: NodeId) -> bool {
        self.from.node == node || self.to.node == node
    }

    /// Same link with both endpoints shifted by `offset`.
    pub fn offset(&self, offset: u32) -> Link {
        Link {
            from: PortRef::new(self.from.node.offset(offset), self.from.port.clone()),
            to: PortRef::new(self.to.node.offset(offset), self.to.port.clone()),
            in_cycle: self.in_cycle,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_cycle {
            write!(f, "{} -> {} (cycle)", self.from, self.to)
        } else {
            write!(f, "{} -> {}", self.from, self.to)
        }
    }
}
