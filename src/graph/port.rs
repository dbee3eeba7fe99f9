//! Port descriptors for the node system.
//!
//! Each node type declares its ports (inputs/outputs) via static `PortDescriptor`
//! arrays. The graph uses these to validate links.

use serde::{Deserialize, Serialize};

/// The kind of data flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Video frames (camera output, filtered frames).
    Video,
    /// Audio sample buffers.
    Audio,
    /// 3-D lookup textures (color LUTs).
    Texture3d,
    /// 4x4 transform matrices.
    Matrix,
    /// Anything else that needs no format negotiation.
    Data,
}

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Static descriptor for a node's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub key: &'static str,
    pub direction: PortDirection,
    pub kind: PortKind,
}

impl PortDescriptor {
    pub const fn input(key: &'static str, kind: PortKind) -> Self {
        Self {
            key,
            direction: PortDirection::Input,
            kind,
        }
    }

    pub const fn output(key: &'static str, kind: PortKind) -> Self {
        Self {
            key,
            direction: PortDirection::Output,
            kind,
        }
    }

    #[inline]
    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }
}
