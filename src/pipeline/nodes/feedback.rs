//! FeedbackNode — mixes its previous output back into each new frame.
//!
//! Meant to sit inside a cycle (`out → … → in`, or directly `out → in`). The
//! output pool is primed on the first producer-side connect, and when `in`
//! is marked in-cycle the worker seeds the loop with one blank frame so the
//! first iteration never waits on itself. In a cycle the loop is paced at the
//! output frame rate and each frame is stamped one interval after its input.
//!
//! The previous output is kept in a two-slot `BufferArena` used ping-pong.
//!
//! Properties: `mix` (weight of the previous frame, default 0.5), `pool_size`.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{NodeBehavior, NodeContext};
use crate::pipeline::payload::{Payload, VideoFrame};
use crate::pipeline::stream_config::StreamConfig;
use crate::pipeline::worker::{RunFlag, Worker};
use crate::runtime::{BufferArena, BufferHandle, Connection, Inlet, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HISTORY_SLOTS: usize = 2;

/// Feedback mixer.
pub struct FeedbackNode {
    mix: f32,
    pool_size: usize,
    primed: bool,
    active: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl FeedbackNode {
    pub fn new() -> Self {
        Self {
            mix: 0.5,
            pool_size: 0,
            primed: false,
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Default for FeedbackNode {
    fn default() -> Self {
        Self::new()
    }
}

/// `out = source × (1 − amount) + previous × amount`.
fn mix_into(out: &mut VideoFrame, source: &VideoFrame, previous: Option<&VideoFrame>, amount: f32) {
    match previous {
        Some(prev) if prev.data.len() == source.data.len() => {
            let keep = 1.0 - amount;
            for ((o, s), p) in out.data.iter_mut().zip(&source.data).zip(&prev.data) {
                *o = (*s as f32 * keep + *p as f32 * amount).round().clamp(0.0, 255.0) as u8;
            }
        }
        _ => out.data.copy_from_slice(&source.data),
    }
    out.sequence = source.sequence;
}

struct Loop {
    inlet: Inlet<Payload>,
    output: Connection<Payload>,
    config: StreamConfig,
    in_cycle: bool,
    mix: f32,
    poll: Duration,
    active: Arc<AtomicBool>,
}

impl Loop {
    fn seed(&self, flag: &RunFlag) {
        while flag.is_running() {
            if let Some(payload) = self.output.acquire_timeout(self.poll) {
                self.output.queue(Message::data(payload, Duration::ZERO));
                return;
            }
        }
    }

    /// Next pooled output buffer shaped like `like`. Waits for a consumer to
    /// recycle one instead of allocating; `None` once the worker stops.
    fn output_buffer(&self, like: &VideoFrame, flag: &RunFlag) -> Option<VideoFrame> {
        while flag.is_running() {
            if let Some(Payload::Video(mut frame)) = self.output.acquire_timeout(self.poll) {
                frame.reshape_like(like);
                return Some(frame);
            }
        }
        None
    }

    fn run(self, flag: RunFlag) -> PipelineResult<()> {
        let interval = self.config.frame_interval().unwrap_or(Duration::from_millis(33));
        let StreamConfig::Video {
            width,
            height,
            format,
            ..
        } = self.config
        else {
            return Err(PipelineError::PortMismatch("feedback needs a video config".into()));
        };
        let mut history =
            BufferArena::with_slots(HISTORY_SLOTS, |_| VideoFrame::new(width, height, format));
        let mut previous: Option<BufferHandle> = None;

        if self.in_cycle {
            self.seed(&flag);
        }
        let mut next = Instant::now();
        while flag.is_running() {
            if !self.active.load(Ordering::Acquire) {
                std::thread::sleep(self.poll);
                next = Instant::now();
                continue;
            }
            let Some(input) = self.inlet.recv_timeout(self.poll) else {
                continue;
            };
            if input.is_end_of_stream() {
                self.output.close(input.timestamp());
                return Ok(());
            }
            let Some(source) = input.payload().and_then(Payload::as_video) else {
                continue;
            };

            let Some(mut out) = self.output_buffer(source, &flag) else {
                return Ok(());
            };
            let prev = previous.map(|h| history.get(h)).transpose()?;
            mix_into(&mut out, source, prev, self.mix);

            let Some(slot) = history.acquire() else {
                return Err(PipelineError::Abandoned("feedback history exhausted".into()));
            };
            let kept = history.get_mut(slot)?;
            kept.reshape_like(&out);
            kept.data.copy_from_slice(&out.data);
            if let Some(old) = previous.replace(slot) {
                history.release(old)?;
            }

            let timestamp = if self.in_cycle {
                if !flag.sleep_until(next, self.poll) {
                    return Ok(());
                }
                next = (next + interval).max(Instant::now());
                input.timestamp() + interval
            } else {
                input.timestamp()
            };
            input.release();
            self.output.queue(Message::data(Payload::Video(out), timestamp));
        }
        Ok(())
    }
}

impl NodeBehavior for FeedbackNode {
    fn name(&self) -> &'static str {
        "Feedback"
    }

    fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        self.mix = ctx.properties().float_or("mix", 0.5).clamp(0.0, 1.0) as f32;
        self.pool_size = ctx
            .properties()
            .int_or("pool_size", ctx.engine().buffer_pool_size as i64)
            .max(1) as usize;
        Ok(())
    }

    fn make_config(&mut self, ctx: &mut NodeContext, _port: &str) -> PipelineResult<StreamConfig> {
        ctx.upstream_config("in")
    }

    fn on_connect(&mut self, ctx: &mut NodeContext, port: &str, producer_side: bool) -> PipelineResult<()> {
        if producer_side {
            if !self.primed {
                let config = match ctx.output_config(port) {
                    Some(config) => config,
                    None => ctx.default_config(port)?,
                };
                let frames = (0..self.pool_size)
                    .filter_map(|_| VideoFrame::for_config(&config).map(Payload::Video));
                let primed = ctx.connection(port)?.prime(frames);
                tracing::debug!("Feedback {} primed {} buffers", ctx.id(), primed);
                self.primed = true;
            }
            return Ok(());
        }

        if self.worker.is_some() {
            return Ok(());
        }
        let Some(inlet) = ctx.inlet(port) else {
            return Ok(());
        };
        let config = match ctx.output_config("out") {
            Some(config) => config,
            None => ctx.upstream_config(port)?,
        };
        let job = Loop {
            inlet,
            output: ctx.connection("out")?,
            config,
            in_cycle: ctx.is_in_cycle(port),
            mix: self.mix,
            poll: ctx.engine().poll_interval(),
            active: Arc::clone(&self.active),
        };
        let faults = ctx.faults();
        self.worker = Some(Worker::spawn(format!("feedback-{}", ctx.id()), move |flag| {
            if let Err(e) = job.run(flag) {
                faults.report(format!("feedback loop failed: {}", e));
            }
        })?);
        Ok(())
    }

    fn on_disconnect(&mut self, _ctx: &mut NodeContext, _port: &str, producer_side: bool) {
        if !producer_side {
            self.stop();
        }
    }

    fn resume(&mut self, _ctx: &mut NodeContext) {
        self.active.store(true, Ordering::Release);
    }

    fn pause(&mut self, _ctx: &mut NodeContext) {
        self.active.store(false, Ordering::Release);
    }

    fn release(&mut self, _ctx: &mut NodeContext) {
        self.active.store(false, Ordering::Release);
        self.stop();
    }
}
