//! Per-output stream configuration and its negotiation primitives.
//!
//! Each output port has one memoized `StreamConfig`, stored in a `ConfigCell`
//! shared with every downstream node. A downstream node reads it through a
//! `ConfigAwait`, which is immediately `Ready` for in-cycle or unbound inputs
//! and only ever waits, bounded, on a non-cyclic upstream.

use crate::graph::PortKind;
use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

/// Pixel layout of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for one `width` × `height` image.
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba8 => pixels * 4,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

/// Negotiated format of the data leaving an output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamConfig {
    Video {
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
    Lut {
        size: u32,
    },
    Matrix,
    Opaque,
}

impl StreamConfig {
    /// Safe default used for unbound or in-cycle inputs.
    pub fn default_for(kind: PortKind) -> Self {
        match kind {
            PortKind::Video => StreamConfig::Video {
                width: 640,
                height: 480,
                format: PixelFormat::Rgba8,
                fps: 30,
            },
            PortKind::Audio => StreamConfig::Audio {
                sample_rate: 48_000,
                channels: 2,
            },
            PortKind::Texture3d => StreamConfig::Lut { size: 33 },
            PortKind::Matrix => StreamConfig::Matrix,
            PortKind::Data => StreamConfig::Opaque,
        }
    }

    /// Bytes per video frame, for video configs.
    pub fn frame_bytes(&self) -> Option<usize> {
        match self {
            StreamConfig::Video {
                width,
                height,
                format,
                ..
            } => Some(format.frame_bytes(*width, *height)),
            _ => None,
        }
    }

    /// Time between frames, for video configs with a frame rate.
    pub fn frame_interval(&self) -> Option<Duration> {
        match self {
            StreamConfig::Video { fps, .. } if *fps > 0 => {
                Some(Duration::from_secs(1) / *fps)
            }
            _ => None,
        }
    }
}

/// Memo slot for one output's config, readable from any thread.
///
/// Waiters block on a channel that never carries a message; resolving drops
/// the only sender, which wakes every waiter at once.
#[derive(Clone)]
pub struct ConfigCell {
    inner: Arc<CellInner>,
}

struct CellInner {
    value: OnceLock<StreamConfig>,
    resolved_tx: Mutex<Option<Sender<()>>>,
    resolved_rx: Receiver<()>,
}

impl Default for ConfigCell {
    fn default() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(CellInner {
                value: OnceLock::new(),
                resolved_tx: Mutex::new(Some(tx)),
                resolved_rx: rx,
            }),
        }
    }
}

impl std::fmt::Debug for ConfigCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConfigCell").field(&self.get()).finish()
    }
}

impl ConfigCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<StreamConfig> {
        self.inner.value.get().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Store `config` unless a value is already memoized. Returns the value
    /// that ends up stored.
    pub fn resolve(&self, config: StreamConfig) -> StreamConfig {
        let value = self.inner.value.get_or_init(|| config).clone();
        // Set before disconnect, so a woken waiter always finds the value
        drop(
            self.inner
                .resolved_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        value
    }

    /// Wait at most `timeout` for a value.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StreamConfig> {
        if let Some(config) = self.get() {
            return Some(config);
        }
        match self.inner.resolved_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => self.get(),
            Err(RecvTimeoutError::Timeout) => None,
        }
    }
}

/// Upstream config as seen from one input port.
#[derive(Debug, Clone)]
pub enum ConfigAwait {
    /// Available now. In-cycle and unbound inputs always resolve here.
    Ready(StreamConfig),
    /// Non-cyclic upstream that has not resolved yet.
    Pending(ConfigCell),
}

impl ConfigAwait {
    pub fn is_ready(&self) -> bool {
        match self {
            ConfigAwait::Ready(_) => true,
            ConfigAwait::Pending(cell) => cell.is_resolved(),
        }
    }

    /// Value if available without waiting.
    pub fn try_get(&self) -> Option<StreamConfig> {
        match self {
            ConfigAwait::Ready(config) => Some(config.clone()),
            ConfigAwait::Pending(cell) => cell.get(),
        }
    }

    /// Wait at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> PipelineResult<StreamConfig> {
        match self {
            ConfigAwait::Ready(config) => Ok(config),
            ConfigAwait::Pending(cell) => cell.wait_timeout(timeout).ok_or_else(|| {
                PipelineError::Timeout(format!("upstream config not available after {:?}", timeout))
            }),
        }
    }
}
