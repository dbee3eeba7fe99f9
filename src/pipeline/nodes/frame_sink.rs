//! FrameSinkNode — records what it consumes.
//!
//! Holds up to `hold` frames at a time (default 1) before releasing the
//! oldest. A buffer delivered again while still held is counted as concurrent
//! reuse. Everything observed goes to a shared `SinkLog`.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::node::{NodeBehavior, NodeContext};
use crate::pipeline::payload::Payload;
use crate::pipeline::worker::Worker;
use crate::runtime::{lock, Frame};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// What a sink has observed so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkRecord {
    pub timestamps: Vec<Duration>,
    pub buffer_ids: Vec<u64>,
    /// Frames whose buffer was still held by this sink when delivered again.
    pub concurrent_reuse: usize,
    pub end_of_stream: bool,
}

impl SinkRecord {
    pub fn frames(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_monotonic(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] < w[1])
    }
}

/// Shared, waitable sink record.
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    inner: Arc<(Mutex<SinkRecord>, Condvar)>,
}

impl SinkLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SinkRecord {
        lock(&self.inner.0).clone()
    }

    pub fn frames(&self) -> usize {
        lock(&self.inner.0).frames()
    }

    fn update(&self, f: impl FnOnce(&mut SinkRecord)) {
        let (record, changed) = &*self.inner;
        f(&mut lock(record));
        changed.notify_all();
    }

    fn wait_until(&self, timeout: Duration, mut done: impl FnMut(&SinkRecord) -> bool) -> bool {
        let (record, changed) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = lock(record);
        while !done(&guard) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            guard = match changed.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Wait until at least `count` frames have arrived in total.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.frames() >= count)
    }

    pub fn wait_for_end_of_stream(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.end_of_stream)
    }
}

/// Recording sink.
pub struct FrameSinkNode {
    log: SinkLog,
    hold: usize,
    worker: Option<Worker>,
}

impl FrameSinkNode {
    pub fn new() -> Self {
        Self::with_log(SinkLog::new())
    }

    pub fn with_log(log: SinkLog) -> Self {
        Self {
            log,
            hold: 1,
            worker: None,
        }
    }

    pub fn log(&self) -> &SinkLog {
        &self.log
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Default for FrameSinkNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for FrameSinkNode {
    fn name(&self) -> &'static str {
        "FrameSink"
    }

    fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        self.hold = ctx.properties().int_or("hold", 1).max(1) as usize;
        Ok(())
    }

    fn on_connect(&mut self, ctx: &mut NodeContext, port: &str, producer_side: bool) -> PipelineResult<()> {
        if producer_side || self.worker.is_some() {
            return Ok(());
        }
        let Some(inlet) = ctx.inlet(port) else {
            return Ok(());
        };
        let log = self.log.clone();
        let hold = self.hold;
        let poll = ctx.engine().poll_interval();

        self.worker = Some(Worker::spawn(format!("sink-{}", ctx.id()), move |flag| {
            let mut held: VecDeque<Frame<Payload>> = VecDeque::with_capacity(hold);
            while flag.is_running() {
                let Some(frame) = inlet.recv_timeout(poll) else {
                    continue;
                };
                if frame.is_end_of_stream() {
                    log.update(|r| r.end_of_stream = true);
                    continue;
                }
                let buffer_id = frame.payload().and_then(Payload::buffer_id);
                let reused = buffer_id.is_some_and(|id| {
                    held.iter()
                        .any(|h| h.payload().and_then(Payload::buffer_id) == Some(id))
                });
                let timestamp = frame.timestamp();
                log.update(|r| {
                    r.timestamps.push(timestamp);
                    r.buffer_ids.extend(buffer_id);
                    if reused {
                        r.concurrent_reuse += 1;
                    }
                });
                held.push_back(frame);
                while held.len() > hold {
                    held.pop_front();
                }
            }
        })?);
        Ok(())
    }

    fn on_disconnect(&mut self, _ctx: &mut NodeContext, _port: &str, producer_side: bool) {
        if !producer_side {
            self.stop();
        }
    }

    fn release(&mut self, _ctx: &mut NodeContext) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{Node, NodeId, NodeType};
    use crate::pipeline::payload::VideoFrame;
    use crate::pipeline::stream_config::PixelFormat;
    use crate::runtime::{Connection, Message, QueuePolicy};

    fn wired(hold: i64) -> (NodeContext, FrameSinkNode, Connection<Payload>) {
        let spec = Node::new(NodeType::FrameSink)
            .with_id(NodeId(3))
            .with_property("hold", hold);
        let mut ctx = NodeContext::new(&spec, Arc::new(EngineConfig::default()));
        let mut sink = FrameSinkNode::new();
        sink.setup(&mut ctx).unwrap();
        let upstream = Connection::new("2.out", QueuePolicy::Unbounded);
        ctx.input_mut("in").unwrap().inlet = Some(upstream.add_consumer());
        sink.on_connect(&mut ctx, "in", false).unwrap();
        (ctx, sink, upstream)
    }

    #[test]
    fn test_records_frames_and_end_of_stream() {
        let (mut ctx, mut sink, upstream) = wired(1);
        for ms in [10, 20, 30] {
            let frame = VideoFrame::new(1, 1, PixelFormat::Rgba8);
            upstream.queue(Message::data(Payload::Video(frame), Duration::from_millis(ms)));
        }
        upstream.close(Duration::from_millis(40));

        assert!(sink.log().wait_for_end_of_stream(Duration::from_secs(1)));
        let record = sink.log().snapshot();
        assert_eq!(record.frames(), 3);
        assert!(record.is_monotonic());
        assert_eq!(record.concurrent_reuse, 0);
        sink.release(&mut ctx);
    }

    #[test]
    fn test_held_buffer_returns_once_sink_moves_on() {
        let (mut ctx, mut sink, upstream) = wired(1);
        upstream.prime([Payload::Video(VideoFrame::new(1, 1, PixelFormat::Rgba8))]);
        let Some(buffer) = upstream.acquire() else {
            panic!("pool empty");
        };
        let id = buffer.buffer_id();
        upstream.queue(Message::data(buffer, Duration::from_millis(1)));
        assert!(sink.log().wait_for_frames(1, Duration::from_secs(1)));

        // Still held by the sink
        assert!(upstream.acquire_timeout(Duration::from_millis(20)).is_none());

        let next = VideoFrame::new(1, 1, PixelFormat::Rgba8);
        upstream.queue(Message::data(Payload::Video(next), Duration::from_millis(2)));
        assert!(sink.log().wait_for_frames(2, Duration::from_secs(1)));
        let recycled = upstream.acquire_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(recycled.buffer_id(), id);
        assert_eq!(sink.log().snapshot().concurrent_reuse, 0);
        sink.release(&mut ctx);
    }
}
