//! Node type enumeration.
//!
//! The set of node types is closed. Each type carries its port template, so a
//! `Node` never stores ports of its own. Production bodies for the hardware
//! types (camera, encoder, ...) are supplied by the embedder through the
//! `NodeRegistry`; the reference types have built-in bodies.

use crate::graph::port::{PortDescriptor, PortKind};
use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

static CAMERA_PORTS: &[PortDescriptor] = &[PortDescriptor::output("out", PortKind::Video)];

static MICROPHONE_PORTS: &[PortDescriptor] = &[PortDescriptor::output("out", PortKind::Audio)];

static SHADER_FILTER_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("in", PortKind::Video),
    PortDescriptor::input("lut", PortKind::Texture3d),
    PortDescriptor::input("transform", PortKind::Matrix),
    PortDescriptor::output("out", PortKind::Video),
];

static LUT_PORTS: &[PortDescriptor] = &[PortDescriptor::output("lut", PortKind::Texture3d)];

static ENCODER_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("video", PortKind::Video),
    PortDescriptor::input("audio", PortKind::Audio),
];

static DISPLAY_PORTS: &[PortDescriptor] = &[PortDescriptor::input("in", PortKind::Video)];

static TEST_PATTERN_PORTS: &[PortDescriptor] = &[PortDescriptor::output("out", PortKind::Video)];

static COLOR_GAIN_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("in", PortKind::Video),
    PortDescriptor::output("out", PortKind::Video),
];

static FRAME_SINK_PORTS: &[PortDescriptor] = &[PortDescriptor::input("in", PortKind::Video)];

static FEEDBACK_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("in", PortKind::Video),
    PortDescriptor::output("out", PortKind::Video),
];

/// Types of nodes that can appear in a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    // Hardware-backed types (bodies supplied by the embedder)
    /// Camera capture source.
    Camera,
    /// Microphone capture source.
    Microphone,
    /// GPU shader filter with optional LUT and transform inputs.
    ShaderFilter,
    /// 3-D color lookup table source.
    Lut3d,
    /// Hardware audio/video encoder.
    Encoder,
    /// On-screen display sink.
    Display,

    // Reference types with built-in bodies
    /// Synthetic frame source standing in for a camera.
    TestPattern,
    /// Per-pixel gain filter run on the software GPU context.
    ColorGain,
    /// Sink that records what it consumes.
    FrameSink,
    /// Feedback mixer meant to sit inside a cycle.
    Feedback,
}

impl NodeType {
    /// Port template for this node type.
    pub fn ports(&self) -> &'static [PortDescriptor] {
        match self {
            NodeType::Camera => CAMERA_PORTS,
            NodeType::Microphone => MICROPHONE_PORTS,
            NodeType::ShaderFilter => SHADER_FILTER_PORTS,
            NodeType::Lut3d => LUT_PORTS,
            NodeType::Encoder => ENCODER_PORTS,
            NodeType::Display => DISPLAY_PORTS,
            NodeType::TestPattern => TEST_PATTERN_PORTS,
            NodeType::ColorGain => COLOR_GAIN_PORTS,
            NodeType::FrameSink => FRAME_SINK_PORTS,
            NodeType::Feedback => FEEDBACK_PORTS,
        }
    }

    /// Find a declared port by key.
    pub fn port(&self, key: &str) -> Option<&'static PortDescriptor> {
        self.ports().iter().find(|p| p.key == key)
    }

    /// Stable tag used in graph descriptions.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeType::Camera => "camera",
            NodeType::Microphone => "microphone",
            NodeType::ShaderFilter => "shader_filter",
            NodeType::Lut3d => "lut3d",
            NodeType::Encoder => "encoder",
            NodeType::Display => "display",
            NodeType::TestPattern => "test_pattern",
            NodeType::ColorGain => "color_gain",
            NodeType::FrameSink => "frame_sink",
            NodeType::Feedback => "feedback",
        }
    }

    /// Parse a type tag. Unknown tags are an error, never a default type.
    pub fn from_tag(tag: &str) -> PipelineResult<NodeType> {
        NodeType::all()
            .iter()
            .copied()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| PipelineError::UnknownNodeType(tag.to_string()))
    }

    /// Get the display name for this node type.
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeType::Camera => "Camera",
            NodeType::Microphone => "Microphone",
            NodeType::ShaderFilter => "Shader Filter",
            NodeType::Lut3d => "3D LUT",
            NodeType::Encoder => "Encoder",
            NodeType::Display => "Display",
            NodeType::TestPattern => "Test Pattern",
            NodeType::ColorGain => "Color Gain",
            NodeType::FrameSink => "Frame Sink",
            NodeType::Feedback => "Feedback",
        }
    }

    /// Get all node types.
    pub fn all() -> &'static [NodeType] {
        &[
            NodeType::Camera,
            NodeType::Microphone,
            NodeType::ShaderFilter,
            NodeType::Lut3d,
            NodeType::Encoder,
            NodeType::Display,
            NodeType::TestPattern,
            NodeType::ColorGain,
            NodeType::FrameSink,
            NodeType::Feedback,
        ]
    }

    /// Check if this node type only produces data.
    pub fn is_source(&self) -> bool {
        self.ports().iter().all(|p| p.is_output())
    }

    /// Check if this node type only consumes data.
    pub fn is_sink(&self) -> bool {
        self.ports().iter().all(|p| p.is_input())
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
