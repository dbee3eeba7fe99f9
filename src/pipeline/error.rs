//! Pipeline-specific error types.

use crate::graph::{NodeId, NodeType};
use thiserror::Error;

/// Errors that can occur within the graph runtime.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Node {node_id} error: {message}")]
    Node { node_id: NodeId, message: String },

    #[error("Node {node_id} failed to set up: {message}")]
    Setup { node_id: NodeId, message: String },

    #[error("Node {0} has already been released")]
    NodeReleased(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node type tag '{0}'")]
    UnknownNodeType(String),

    #[error("No factory registered for node type {0}")]
    UnregisteredNodeType(NodeType),

    #[error("Node {node_id} has no port '{port}'")]
    UnknownPort { node_id: NodeId, port: String },

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Duplicate link: {0}")]
    DuplicateLink(String),

    #[error("Port mismatch: {0}")]
    PortMismatch(String),

    #[error("Mailbox '{0}' is closed")]
    MailboxClosed(String),

    #[error("Task on mailbox '{mailbox}' panicked: {message}")]
    TaskPanicked { mailbox: String, message: String },

    #[error("Mailbox '{0}' cannot wait on itself")]
    Reentrant(String),

    #[error("Operation abandoned: {0}")]
    Abandoned(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Device '{device}' failed: {message}")]
    Device { device: String, message: String },

    #[error("Buffer handle {0} is stale or was never acquired")]
    StaleBuffer(String),

    #[error("Buffer handle {0} released twice")]
    DoubleRelease(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a node-local failure.
    pub fn node(node_id: NodeId, message: impl Into<String>) -> Self {
        PipelineError::Node {
            node_id,
            message: message.into(),
        }
    }

    /// Whether this error only means the target mailbox is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineError::MailboxClosed(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
