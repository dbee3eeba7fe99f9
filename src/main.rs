//! mediagraph demo
//!
//! Runs a test pattern through a color gain into a sink, hot-swaps the gain
//! for a feedback mixer next to a self-looping feedback branch, prints the
//! live topology as JSON and shuts everything down.
//!
//! Usage: `mediagraph [engine.toml]`

use anyhow::Context;
use mediagraph::{
    config::EngineConfig,
    graph::{Link, Network, Node, NodeType, PortRef},
    pipeline::{nodes::SoftwareGpu, NetworkEvent, NetworkExecutor, NodeRegistry},
    runtime::DeviceContext,
};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_logging(config: &EngineConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mediagraph.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path)
            .with_context(|| format!("Failed to load engine config from {}", path))?,
        None => EngineConfig::default(),
    };
    let _log_guard = init_logging(&config);
    tracing::info!("Starting mediagraph demo");

    let swap_timeout = config.command_timeout();
    let gpu = DeviceContext::spawn("gpu", SoftwareGpu::new())?;
    let registry = NodeRegistry::with_builtins(gpu.clone());
    tracing::debug!("Registered node types: {:?}", registry.registered_types());
    let (network, events) = NetworkExecutor::spawn(registry, config)?;

    // source -> gain -> sink
    let mut graph = Network::new();
    let source = graph.insert_node(Node::new(NodeType::TestPattern).with_property("fps", 60i64));
    let gain = graph.insert_node(Node::new(NodeType::ColorGain).with_property("gain", 1.5));
    let sink = graph.insert_node(Node::new(NodeType::FrameSink));
    graph.connect(PortRef::new(source, "out"), PortRef::new(gain, "in"))?;
    graph.connect(PortRef::new(gain, "out"), PortRef::new(sink, "in"))?;
    network.start(graph.clone()).context("Failed to start network")?;
    std::thread::sleep(Duration::from_millis(250));

    // Swap the gain for a feedback mixer and add a self-looping branch
    let mut swapped = graph;
    swapped.remove_node(gain);
    let mixer = swapped.insert_node(Node::new(NodeType::Feedback).with_property("mix", 0.7));
    swapped.connect(PortRef::new(source, "out"), PortRef::new(mixer, "in"))?;
    swapped.connect(PortRef::new(mixer, "out"), PortRef::new(sink, "in"))?;
    let echo = swapped.insert_node(Node::new(NodeType::Feedback));
    let echo_sink = swapped.insert_node(Node::new(NodeType::FrameSink));
    swapped.insert_link(Link::cyclic(PortRef::new(echo, "out"), PortRef::new(echo, "in")))?;
    swapped.connect(PortRef::new(echo, "out"), PortRef::new(echo_sink, "in"))?;

    let diff = network
        .apply_with_timeout(swapped, swap_timeout)
        .context("Hot swap failed")?;
    tracing::info!(
        "Swap replaced {} nodes with {}",
        diff.stale_nodes.len(),
        diff.new_nodes.len()
    );
    std::thread::sleep(Duration::from_millis(250));

    let snapshot = network.snapshot()?;
    println!("{}", snapshot.to_json()?);

    network.stop().context("Failed to stop network")?;
    gpu.shutdown();

    for event in events.drain() {
        match event {
            NetworkEvent::NodeDegraded { node, reason } | NetworkEvent::NodeFaulted { node, reason } => {
                tracing::warn!("Node {} reported: {}", node, reason);
            }
            NetworkEvent::CycleDrained {
                link,
                frames_drained,
                eos_received,
            } => tracing::info!(
                "Drained {} frames from {} (end-of-stream: {})",
                frames_drained,
                link,
                eos_received
            ),
            _ => {}
        }
    }
    tracing::info!("mediagraph demo finished");
    Ok(())
}
