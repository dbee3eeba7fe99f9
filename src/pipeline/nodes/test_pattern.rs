//! TestPatternNode — demand-driven synthetic video source.
//!
//! Stands in for a camera: capture starts when the first consumer attaches to
//! `out` and stops when the last one leaves. While resumed, frames are paced
//! at the configured frame rate and stamped `sequence × frame interval`, so
//! timestamps stay monotonic across capture restarts.
//!
//! Properties: `width`, `height`, `fps`, `pool_size`.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{NodeBehavior, NodeContext};
use crate::pipeline::payload::{Payload, VideoFrame};
use crate::pipeline::stream_config::{PixelFormat, StreamConfig};
use crate::pipeline::worker::Worker;
use crate::runtime::Message;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable capture state, shared with whoever built the node.
#[derive(Debug, Clone, Default)]
pub struct CaptureMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug, Default)]
struct MonitorInner {
    capturing: AtomicBool,
    starts: AtomicU64,
    stops: AtomicU64,
    frames: AtomicU64,
}

impl CaptureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::Acquire)
    }

    pub fn starts(&self) -> u64 {
        self.inner.starts.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.inner.stops.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    fn started(&self) {
        self.inner.starts.fetch_add(1, Ordering::Relaxed);
        self.inner.capturing.store(true, Ordering::Release);
    }

    fn stopped(&self) {
        self.inner.stops.fetch_add(1, Ordering::Relaxed);
        self.inner.capturing.store(false, Ordering::Release);
    }
}

/// Synthetic camera.
pub struct TestPatternNode {
    config: Option<StreamConfig>,
    pool_size: usize,
    primed: bool,
    sequence: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    worker: Option<Worker>,
    monitor: CaptureMonitor,
}

impl TestPatternNode {
    pub fn new() -> Self {
        Self {
            config: None,
            pool_size: 0,
            primed: false,
            sequence: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
            monitor: CaptureMonitor::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: CaptureMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn monitor(&self) -> &CaptureMonitor {
        &self.monitor
    }

    fn start_capture(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(config) = self.config.clone() else {
            return Err(PipelineError::node(ctx.id(), "capture started before setup"));
        };
        let interval = config.frame_interval().unwrap_or(Duration::from_millis(33));
        let connection = ctx.connection("out")?;
        let poll = ctx.engine().poll_interval();
        let sequence = Arc::clone(&self.sequence);
        let active = Arc::clone(&self.active);
        let monitor = self.monitor.clone();

        let worker = Worker::spawn(format!("pattern-{}", ctx.id()), move |flag| {
            let mut next = Instant::now();
            while flag.is_running() {
                if !active.load(Ordering::Acquire) {
                    std::thread::sleep(poll);
                    next = Instant::now();
                    continue;
                }
                if !flag.sleep_until(next, poll) {
                    break;
                }
                next = (next + interval).max(Instant::now());

                let Some(Payload::Video(mut frame)) = connection.acquire_timeout(poll) else {
                    continue;
                };
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                paint(&mut frame, seq);
                let timestamp = Duration::from_nanos((interval.as_nanos() as u64).saturating_mul(seq));
                connection.queue(Message::data(Payload::Video(frame), timestamp));
                monitor.inner.frames.fetch_add(1, Ordering::Relaxed);
            }
        })?;

        self.monitor.started();
        self.worker = Some(worker);
        tracing::debug!("Test pattern {} capture started", ctx.id());
        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            self.monitor.stopped();
        }
    }
}

impl Default for TestPatternNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Moving diagonal gradient; byte 0 of each pixel carries the low sequence bits.
fn paint(frame: &mut VideoFrame, seq: u64) {
    frame.sequence = seq;
    let width = frame.width.max(1) as usize;
    for (i, pixel) in frame.data.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % width, i / width);
        pixel[0] = seq as u8;
        pixel[1] = (x + seq as usize) as u8;
        pixel[2] = (y + seq as usize) as u8;
        pixel[3] = 255;
    }
}

impl NodeBehavior for TestPatternNode {
    fn name(&self) -> &'static str {
        "TestPattern"
    }

    fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        let props = ctx.properties();
        let width = props.int_or("width", 640);
        let height = props.int_or("height", 480);
        let fps = props.int_or("fps", 30);
        let pool_size = props.int_or("pool_size", ctx.engine().buffer_pool_size as i64);
        if width <= 0 || height <= 0 || fps <= 0 || pool_size <= 0 {
            return Err(PipelineError::node(
                ctx.id(),
                format!("unsupported format {}x{}@{} (pool {})", width, height, fps, pool_size),
            ));
        }
        self.pool_size = pool_size as usize;
        self.config = Some(StreamConfig::Video {
            width: width as u32,
            height: height as u32,
            format: PixelFormat::Rgba8,
            fps: fps as u32,
        });
        Ok(())
    }

    fn make_config(&mut self, ctx: &mut NodeContext, port: &str) -> PipelineResult<StreamConfig> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => ctx.default_config(port),
        }
    }

    fn on_connect(&mut self, ctx: &mut NodeContext, _port: &str, producer_side: bool) -> PipelineResult<()> {
        if !producer_side {
            return Ok(());
        }
        if !self.primed {
            let config = ctx
                .output_config("out")
                .or_else(|| self.config.clone())
                .ok_or_else(|| PipelineError::node(ctx.id(), "no output config"))?;
            let frames = (0..self.pool_size).filter_map(|_| VideoFrame::for_config(&config).map(Payload::Video));
            let primed = ctx.connection("out")?.prime(frames);
            tracing::debug!("Test pattern {} primed {} buffers", ctx.id(), primed);
            self.primed = true;
        }
        self.start_capture(ctx)
    }

    fn on_disconnect(&mut self, ctx: &mut NodeContext, _port: &str, producer_side: bool) {
        if producer_side && ctx.linked_outputs() == 0 {
            self.stop_capture();
            tracing::debug!("Test pattern {} capture stopped", ctx.id());
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
        self.stop_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{Node, NodeId, NodeType};

    fn ctx_with(node: Node) -> NodeContext {
        NodeContext::new(&node.with_id(NodeId(1)), Arc::new(EngineConfig::default()))
    }

    fn small() -> Node {
        Node::new(NodeType::TestPattern)
            .with_property("width", 4i64)
            .with_property("height", 2i64)
            .with_property("fps", 200i64)
    }

    #[test]
    fn test_setup_rejects_empty_frames() {
        let mut ctx = ctx_with(Node::new(NodeType::TestPattern).with_property("width", 0i64));
        let mut node = TestPatternNode::new();
        assert!(node.setup(&mut ctx).is_err());
    }

    #[test]
    fn test_produces_only_while_consumed_and_resumed() {
        let mut ctx = ctx_with(small());
        let mut node = TestPatternNode::new();
        node.setup(&mut ctx).unwrap();

        let connection = ctx.connection("out").unwrap();
        let inlet = connection.add_consumer();
        node.on_connect(&mut ctx, "out", true).unwrap();
        assert!(node.monitor().is_capturing());
        assert_eq!(connection.pool_len(), 3);

        // Paused: nothing arrives
        assert!(inlet.recv_timeout(Duration::from_millis(30)).is_none());

        node.resume(&mut ctx);
        let first = inlet.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = inlet.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(second.timestamp() > first.timestamp());
        let frame = first.payload().and_then(Payload::as_video).unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        drop((first, second));

        connection.remove_consumer(inlet.id());
        node.on_disconnect(&mut ctx, "out", true);
        assert!(!node.monitor().is_capturing());
        assert_eq!(node.monitor().stops(), 1);
        node.release(&mut ctx);
    }

    #[test]
    fn test_paint_marks_sequence() {
        let mut frame = VideoFrame::new(2, 1, PixelFormat::Rgba8);
        paint(&mut frame, 7);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.data[0], 7);
        assert_eq!(frame.data[3], 255);
    }
}
