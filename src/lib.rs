//! # mediagraph: live-mutable media processing graphs
//!
//! A runtime for graphs of media nodes (sources, filters, sinks) that can be
//! rewired while frames are flowing. Every node runs in its own mailbox actor;
//! frames move between nodes through connections that recycle their buffers
//! back to the producer.
//!
//! ## Architecture
//!
//! - **runtime**: Mailbox actors, connections, buffer arenas, device contexts
//! - **graph**: Declarative `Network` descriptions (nodes, links, properties)
//! - **pipeline**: Node executors, the network executor and built-in nodes
//! - **config**: `EngineConfig` loaded from TOML
//!
//! ## Example
//!
//! ```ignore
//! use mediagraph::{
//!     config::EngineConfig,
//!     graph::{Network, Node, NodeType, PortRef},
//!     pipeline::{nodes::SoftwareGpu, NetworkExecutor, NodeRegistry},
//!     runtime::DeviceContext,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let gpu = DeviceContext::spawn("gpu", SoftwareGpu::new())?;
//!     let registry = NodeRegistry::with_builtins(gpu.clone());
//!     let (network, events) = NetworkExecutor::spawn(registry, EngineConfig::default())?;
//!
//!     let mut graph = Network::new();
//!     let source = graph.insert_node(Node::new(NodeType::TestPattern));
//!     let sink = graph.insert_node(Node::new(NodeType::FrameSink));
//!     graph.connect(PortRef::new(source, "out"), PortRef::new(sink, "in"))?;
//!
//!     network.start(graph)?;
//!     // ...
//!     network.stop()?;
//!     gpu.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod runtime;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use graph::{Link, Network, Node, NodeId, NodeType, PortRef};
pub use pipeline::{NetworkCommand, NetworkEvent, NetworkExecutor, NodeRegistry, PipelineError};
