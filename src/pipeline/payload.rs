//! Payload buffers carried between nodes.
//!
//! Every buffer gets a process-unique id at allocation. Ids survive recycling,
//! so a consumer can tell two frames backed by the same physical buffer apart
//! from two distinct buffers.

use crate::pipeline::stream_config::{PixelFormat, StreamConfig};
use crate::runtime::BufferHandle;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A reusable video frame buffer.
#[derive(Debug)]
pub struct VideoFrame {
    id: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Producer sequence number of the content currently in the buffer.
    pub sequence: u64,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id: next_buffer_id(),
            width,
            height,
            format,
            data: vec![0; format.frame_bytes(width, height)],
            sequence: 0,
        }
    }

    /// Allocate a frame matching a video config.
    pub fn for_config(config: &StreamConfig) -> Option<Self> {
        match config {
            StreamConfig::Video {
                width,
                height,
                format,
                ..
            } => Some(Self::new(*width, *height, *format)),
            _ => None,
        }
    }

    pub fn buffer_id(&self) -> u64 {
        self.id
    }

    /// Take on the geometry of `like` in place. The buffer id is kept.
    pub fn reshape_like(&mut self, like: &VideoFrame) {
        self.width = like.width;
        self.height = like.height;
        self.format = like.format;
        self.data.resize(like.data.len(), 0);
    }

    /// Whether this buffer can hold frames of `config` without reallocating.
    pub fn matches(&self, config: &StreamConfig) -> bool {
        matches!(config, StreamConfig::Video { width, height, format, .. }
            if *width == self.width && *height == self.height && *format == self.format)
    }
}

/// A reusable block of interleaved audio samples.
#[derive(Debug)]
pub struct AudioBuffer {
    id: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self {
            id: next_buffer_id(),
            sample_rate,
            channels,
            samples: vec![0.0; frames * channels as usize],
        }
    }

    pub fn buffer_id(&self) -> u64 {
        self.id
    }
}

/// Payload of one message on a connection.
#[derive(Debug)]
pub enum Payload {
    Video(VideoFrame),
    Audio(AudioBuffer),
    /// Slot in a device-side texture arena (e.g. a 3-D LUT).
    Texture(BufferHandle),
    /// Column-major 4×4 transform.
    Matrix([f32; 16]),
}

impl Payload {
    /// Identity of the backing buffer, where there is one.
    pub fn buffer_id(&self) -> Option<u64> {
        match self {
            Payload::Video(frame) => Some(frame.buffer_id()),
            Payload::Audio(buffer) => Some(buffer.buffer_id()),
            Payload::Texture(_) | Payload::Matrix(_) => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoFrame> {
        match self {
            Payload::Video(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn into_video(self) -> Option<VideoFrame> {
        match self {
            Payload::Video(frame) => Some(frame),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PortKind;

    #[test]
    fn test_buffer_ids_are_unique() {
        let a = VideoFrame::new(2, 2, PixelFormat::Rgba8);
        let b = VideoFrame::new(2, 2, PixelFormat::Rgba8);
        assert_ne!(a.buffer_id(), b.buffer_id());
        assert_eq!(a.data.len(), 16);
    }

    #[test]
    fn test_frame_for_config() {
        let config = StreamConfig::default_for(PortKind::Video);
        let frame = VideoFrame::for_config(&config).unwrap();
        assert!(frame.matches(&config));
        assert!(VideoFrame::for_config(&StreamConfig::Matrix).is_none());
    }

    #[test]
    fn test_reshape_keeps_buffer_identity() {
        let like = VideoFrame::new(2, 1, PixelFormat::Rgba8);
        let mut frame = VideoFrame::new(4, 4, PixelFormat::Rgba8);
        let id = frame.buffer_id();
        frame.reshape_like(&like);
        assert_eq!(frame.buffer_id(), id);
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.data.len(), like.data.len());
    }

    #[test]
    fn test_payload_accessors() {
        let payload = Payload::Video(VideoFrame::new(1, 1, PixelFormat::Rgba8));
        assert!(payload.buffer_id().is_some());
        assert!(payload.as_video().is_some());
        assert!(Payload::Matrix([0.0; 16]).buffer_id().is_none());
    }
}
