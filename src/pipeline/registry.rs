//! Node registry: maps node types to body factories.
//!
//! Built once at startup and handed to the `NetworkExecutor`. There is no
//! process-wide registry; an embedder that provides camera or encoder bodies
//! registers them on its own instance.

use crate::graph::{Node, NodeType};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{AnyNode, BuiltinNode};
use crate::pipeline::nodes::{ColorGainNode, FeedbackNode, FrameSinkNode, SoftwareGpu, TestPatternNode};
use crate::runtime::DeviceContext;
use std::collections::HashMap;

/// Builds the body of one node from its descriptor.
pub type NodeFactory = Box<dyn Fn(&Node) -> PipelineResult<AnyNode> + Send + Sync>;

/// Factory table keyed by node type.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<NodeType, NodeFactory>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in body. Hardware types stay unregistered.
    pub fn with_builtins(gpu: DeviceContext<SoftwareGpu>) -> Self {
        let mut registry = Self::new();
        for node_type in NodeType::all() {
            match node_type {
                NodeType::TestPattern => registry.register(*node_type, |_| {
                    Ok(AnyNode::Builtin(BuiltinNode::TestPattern(TestPatternNode::new())))
                }),
                NodeType::ColorGain => {
                    let gpu = gpu.clone();
                    registry.register(*node_type, move |_| {
                        Ok(AnyNode::Builtin(BuiltinNode::ColorGain(ColorGainNode::new(gpu.clone()))))
                    })
                }
                NodeType::FrameSink => registry.register(*node_type, |_| {
                    Ok(AnyNode::Builtin(BuiltinNode::FrameSink(FrameSinkNode::new())))
                }),
                NodeType::Feedback => registry.register(*node_type, |_| {
                    Ok(AnyNode::Builtin(BuiltinNode::Feedback(FeedbackNode::new())))
                }),
                NodeType::Camera
                | NodeType::Microphone
                | NodeType::ShaderFilter
                | NodeType::Lut3d
                | NodeType::Encoder
                | NodeType::Display => {}
            }
        }
        registry
    }

    /// Register (or replace) the factory for `node_type`.
    pub fn register(
        &mut self,
        node_type: NodeType,
        factory: impl Fn(&Node) -> PipelineResult<AnyNode> + Send + Sync + 'static,
    ) {
        if self.factories.insert(node_type, Box::new(factory)).is_some() {
            tracing::debug!("Replaced factory for {}", node_type);
        }
    }

    /// Build the body for `node`.
    pub fn create(&self, node: &Node) -> PipelineResult<AnyNode> {
        let factory = self
            .factories
            .get(&node.node_type)
            .ok_or(PipelineError::UnregisteredNodeType(node.node_type))?;
        factory(node)
    }

    pub fn is_registered(&self, node_type: NodeType) -> bool {
        self.factories.contains_key(&node_type)
    }

    /// Registered types in declaration order.
    pub fn registered_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.factories.keys().copied().collect();
        types.sort();
        types
    }
}
