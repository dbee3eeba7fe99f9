//! ColorGainNode — per-pixel gain filter run on the software GPU.
//!
//! A worker started on the consumer-side connect pulls frames from `in`,
//! copies each into a buffer from the node's own output pool, scales it on
//! the `SoftwareGpu` device thread and queues it on `out` with the input's
//! timestamp. End-of-stream on `in` closes `out`. A failing device is
//! reported as a fault, which degrades the node.
//!
//! Properties: `gain` (default 1.0), `pool_size`.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::node::{NodeBehavior, NodeContext};
use crate::pipeline::nodes::gpu::SoftwareGpu;
use crate::pipeline::payload::{Payload, VideoFrame};
use crate::pipeline::stream_config::StreamConfig;
use crate::pipeline::worker::Worker;
use crate::runtime::{DeviceContext, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Gain filter.
pub struct ColorGainNode {
    gpu: DeviceContext<SoftwareGpu>,
    gain: f32,
    pool_size: usize,
    primed: bool,
    active: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl ColorGainNode {
    pub fn new(gpu: DeviceContext<SoftwareGpu>) -> Self {
        Self {
            gpu,
            gain: 1.0,
            pool_size: 0,
            primed: false,
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn start(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(inlet) = ctx.inlet("in") else {
            return Ok(());
        };
        let output = ctx.connection("out")?;
        let faults = ctx.faults();
        let poll = ctx.engine().poll_interval();
        let gpu = self.gpu.clone();
        let gain = self.gain;
        let active = Arc::clone(&self.active);

        let worker = Worker::spawn(format!("gain-{}", ctx.id()), move |flag| {
            while flag.is_running() {
                if !active.load(Ordering::Acquire) {
                    std::thread::sleep(poll);
                    continue;
                }
                let Some(input) = inlet.recv_timeout(poll) else {
                    continue;
                };
                if input.is_end_of_stream() {
                    output.close(input.timestamp());
                    break;
                }
                let Some(source) = input.payload().and_then(Payload::as_video) else {
                    continue;
                };

                // Pool exhausted: skip this input rather than grow the pool
                let Some(Payload::Video(mut frame)) = output.acquire_timeout(poll) else {
                    tracing::trace!("Gain {} dropped a frame, output pool empty", output.name());
                    input.release();
                    continue;
                };
                frame.reshape_like(source);
                frame.data.copy_from_slice(&source.data);
                frame.sequence = source.sequence;
                let timestamp = input.timestamp();
                input.release();

                match gpu.with(move |device| device.apply_gain(&mut frame, gain).map(|_| frame)) {
                    Ok(Ok(frame)) => {
                        output.queue(Message::data(Payload::Video(frame), timestamp));
                    }
                    Ok(Err(e)) | Err(e) => {
                        faults.report(format!("gain dispatch failed: {}", e));
                        break;
                    }
                }
            }
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl NodeBehavior for ColorGainNode {
    fn name(&self) -> &'static str {
        "ColorGain"
    }

    fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()> {
        self.gain = ctx.properties().float_or("gain", 1.0) as f32;
        self.pool_size = ctx
            .properties()
            .int_or("pool_size", ctx.engine().buffer_pool_size as i64)
            .max(1) as usize;
        Ok(())
    }

    fn make_config(&mut self, ctx: &mut NodeContext, _port: &str) -> PipelineResult<StreamConfig> {
        ctx.upstream_config("in")
    }

    fn on_connect(&mut self, ctx: &mut NodeContext, _port: &str, producer_side: bool) -> PipelineResult<()> {
        if !producer_side {
            return self.start(ctx);
        }
        if !self.primed {
            if let Some(config) = ctx.output_config("out") {
                let frames = (0..self.pool_size)
                    .filter_map(|_| VideoFrame::for_config(&config).map(Payload::Video));
                ctx.connection("out")?.prime(frames);
            }
            self.primed = true;
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{Node, NodeId, NodeType};
    use crate::pipeline::stream_config::PixelFormat;
    use crate::runtime::{Connection, QueuePolicy};
    use std::time::Duration;

    struct Rig {
        ctx: NodeContext,
        node: ColorGainNode,
        upstream: Connection<Payload>,
        gpu: DeviceContext<SoftwareGpu>,
    }

    fn rig(gain: f64) -> Rig {
        let gpu = DeviceContext::spawn("gpu-gain-test", SoftwareGpu::new()).unwrap();
        let spec = Node::new(NodeType::ColorGain)
            .with_id(NodeId(2))
            .with_property("gain", gain);
        let mut ctx = NodeContext::new(&spec, Arc::new(EngineConfig::default()));
        let mut node = ColorGainNode::new(gpu.clone());
        node.setup(&mut ctx).unwrap();

        let upstream = Connection::new("1.out", QueuePolicy::Unbounded);
        ctx.input_mut("in").unwrap().inlet = Some(upstream.add_consumer());
        Rig {
            ctx,
            node,
            upstream,
            gpu,
        }
    }

    fn pixel_frame(value: u8) -> Payload {
        let mut frame = VideoFrame::new(1, 1, PixelFormat::Rgba8);
        frame.data.copy_from_slice(&[value, value, value, 255]);
        Payload::Video(frame)
    }

    #[test]
    fn test_gain_applied_and_timestamp_forwarded() {
        let mut rig = rig(2.0);
        let output = rig.ctx.connection("out").unwrap();
        output.prime([pixel_frame(0)]);
        let out = output.add_consumer();
        rig.node.resume(&mut rig.ctx);
        rig.node.on_connect(&mut rig.ctx, "in", false).unwrap();

        rig.upstream
            .queue(Message::data(pixel_frame(50), Duration::from_millis(40)));
        let frame = out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.timestamp(), Duration::from_millis(40));
        let video = frame.payload().and_then(Payload::as_video).unwrap();
        assert_eq!(&video.data[..], &[100, 100, 100, 255]);

        // Input buffer went back to the upstream pool
        assert_eq!(rig.upstream.pool_len(), 1);
        rig.node.release(&mut rig.ctx);
        rig.gpu.shutdown();
    }

    #[test]
    fn test_output_pool_stays_bounded_under_held_frames() {
        let mut rig = rig(1.0);
        let output = rig.ctx.connection("out").unwrap();
        output.prime((0..3).map(|_| pixel_frame(0)));
        let out = output.add_consumer();
        rig.node.resume(&mut rig.ctx);
        rig.node.on_connect(&mut rig.ctx, "in", false).unwrap();

        // Nothing reads `out`, so every emitted frame stays held
        for i in 0..10u64 {
            rig.upstream
                .queue(Message::data(pixel_frame(i as u8), Duration::from_millis(i)));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while rig.upstream.pool_len() < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(rig.upstream.pool_len(), 10, "inputs not all consumed");
        assert_eq!(out.len(), 3);

        let ids: std::collections::BTreeSet<u64> = std::iter::from_fn(|| out.try_recv())
            .filter_map(|frame| frame.payload().and_then(Payload::buffer_id))
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(output.pool_len(), 3);

        rig.node.release(&mut rig.ctx);
        rig.gpu.shutdown();
    }

    #[test]
    fn test_end_of_stream_propagates() {
        let mut rig = rig(1.0);
        let out = rig.ctx.connection("out").unwrap().add_consumer();
        rig.node.resume(&mut rig.ctx);
        rig.node.on_connect(&mut rig.ctx, "in", false).unwrap();

        rig.upstream.close(Duration::from_millis(5));
        let frame = out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(frame.is_end_of_stream());
        rig.node.release(&mut rig.ctx);
        rig.gpu.shutdown();
    }

    #[test]
    fn test_config_follows_upstream() {
        let mut rig = rig(1.0);
        let upstream = crate::pipeline::stream_config::ConfigCell::new();
        let config = StreamConfig::Video {
            width: 8,
            height: 8,
            format: PixelFormat::Rgba8,
            fps: 60,
        };
        upstream.resolve(config.clone());
        rig.ctx.input_mut("in").unwrap().upstream = Some(upstream);
        assert_eq!(rig.node.make_config(&mut rig.ctx, "out").unwrap(), config);
        rig.gpu.shutdown();
    }
}
