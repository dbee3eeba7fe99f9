//! Live media graph execution.
//!
//! A `Network` description is turned into one `NodeExecutor` per node and one
//! `Connection` per linked output. Every node runs on its own mailbox thread;
//! frames travel between them through the connections and their buffers are
//! recycled back to the producer.
//!
//! # Architecture
//!
//! ```text
//! [TestPattern] ──► [ColorGain] ──► [FrameSink]
//!                        ▲               │
//!                        └── in-cycle ───┘   (feedback loops are allowed)
//! ```
//!
//! - **node**: `NodeBehavior` trait, `NodeContext` and built-in dispatch.
//! - **node_executor**: Lifecycle, memoized config and port wiring of one node.
//! - **executor**: `NetworkExecutor`, live add/remove, hot swap and shutdown.
//! - **registry**: Node type → body factory table.
//! - **bridge**: Events and topology snapshots for the driver.
//!
//! # Design
//!
//! - **Enum dispatch for built-ins**: `BuiltinNode` covers the reference
//!   bodies, `AnyNode::Plugin` boxes anything else.
//! - **Config never blocks a cycle**: in-cycle inputs resolve from the
//!   memoized config or the port default, never by waiting.
//! - **Links before nodes**: teardown always unwires before it releases.

pub mod bridge;
pub mod error;
pub mod executor;
pub mod node;
pub mod node_executor;
pub mod nodes;
pub mod payload;
pub mod registry;
pub mod stream_config;
pub mod worker;

pub use bridge::{event_channel, EventSender, NetworkEvent, NetworkEvents, TopologySnapshot};
pub use error::{PipelineError, PipelineResult};
pub use executor::{NetworkCommand, NetworkExecutor};
pub use node::{AnyNode, BuiltinNode, FaultReporter, NodeBehavior, NodeContext, PortState};
pub use node_executor::{Lifecycle, NodeExecutor, NodeStatus, PortStatus};
pub use payload::{AudioBuffer, Payload, VideoFrame};
pub use registry::{NodeFactory, NodeRegistry};
pub use stream_config::{ConfigAwait, ConfigCell, PixelFormat, StreamConfig};
pub use worker::{RunFlag, Worker};
