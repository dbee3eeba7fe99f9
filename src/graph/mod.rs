//! Declarative graph description.
//!
//! # Architecture
//!
//! - **id**: `NodeId` and `PortRef` addressing.
//! - **port**: Static port descriptors (`PortKind`, `PortDirection`).
//! - **property**: Typed property bags attached to nodes and networks.
//! - **node_type**: The closed set of node types and their port templates.
//! - **node**: `Node` and `Link` descriptors.
//! - **network**: The `Network` container with validation, splicing, cycle
//!   marking and diffing.

pub mod id;
pub mod network;
pub mod node;
pub mod node_type;
pub mod port;
pub mod property;

pub use id::{NodeId, PortRef};
pub use network::{GraphDiff, Network};
pub use node::{Link, Node};
pub use node_type::NodeType;
pub use port::{PortDescriptor, PortDirection, PortKind};
pub use property::{Properties, PropertyValue};
