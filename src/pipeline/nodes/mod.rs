//! Built-in node implementations.

pub mod color_gain;
pub mod feedback;
pub mod frame_sink;
pub mod gpu;
pub mod test_pattern;

pub use color_gain::ColorGainNode;
pub use feedback::FeedbackNode;
pub use frame_sink::{FrameSinkNode, SinkLog, SinkRecord};
pub use gpu::SoftwareGpu;
pub use test_pattern::{CaptureMonitor, TestPatternNode};
