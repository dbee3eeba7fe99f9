//! SoftwareGpu — a CPU stand-in for a GPU context.
//!
//! It is only ever touched from its `DeviceContext` mailbox thread, which it
//! records so tests can check that every dispatch was confined to one thread.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::payload::VideoFrame;
use std::thread::{self, ThreadId};

/// Device state for per-pixel kernels.
#[derive(Debug, Default)]
pub struct SoftwareGpu {
    dispatches: u64,
    threads: Vec<ThreadId>,
    lost: bool,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_dispatch(&mut self) -> PipelineResult<()> {
        if self.lost {
            return Err(PipelineError::Device {
                device: "software-gpu".to_string(),
                message: "device lost".to_string(),
            });
        }
        let current = thread::current().id();
        if !self.threads.contains(&current) {
            self.threads.push(current);
        }
        self.dispatches += 1;
        Ok(())
    }

    /// Multiply every color channel by `gain`, saturating. Alpha is kept.
    pub fn apply_gain(&mut self, frame: &mut VideoFrame, gain: f32) -> PipelineResult<()> {
        self.begin_dispatch()?;
        for pixel in frame.data.chunks_exact_mut(4) {
            for channel in &mut pixel[..3] {
                *channel = (*channel as f32 * gain).clamp(0.0, 255.0) as u8;
            }
        }
        Ok(())
    }

    /// Blend `src` over `dst` with weight `amount` for `src`.
    pub fn blend(&mut self, dst: &mut VideoFrame, src: &VideoFrame, amount: f32) -> PipelineResult<()> {
        self.begin_dispatch()?;
        let keep = 1.0 - amount;
        for (d, s) in dst.data.iter_mut().zip(&src.data) {
            *d = (*d as f32 * keep + *s as f32 * amount).round().clamp(0.0, 255.0) as u8;
        }
        Ok(())
    }

    /// Simulate the device disappearing; every later dispatch fails.
    pub fn lose_device(&mut self) {
        self.lost = true;
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Distinct threads that have dispatched work.
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }
}
