//! Mock construction helpers

use mediagraph::graph::NodeType;
use mediagraph::pipeline::{AnyNode, NodeBehavior, NodeContext, NodeRegistry, PipelineError, PipelineResult};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Camera {}

    impl NodeBehavior for Camera {
        fn name(&self) -> &'static str;
        fn setup(&mut self, ctx: &mut NodeContext) -> PipelineResult<()>;
        fn resume(&mut self, ctx: &mut NodeContext);
        fn pause(&mut self, ctx: &mut NodeContext);
        fn release(&mut self, ctx: &mut NodeContext);
    }
}

/// How often each hook of the mocked cameras ran.
#[derive(Clone, Default)]
pub struct HookCounts {
    pub resumes: Arc<AtomicUsize>,
    pub pauses: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
}

impl HookCounts {
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// A camera body whose device cannot be opened.
pub fn failing_camera(counts: &HookCounts) -> MockCamera {
    let mut camera = MockCamera::new();
    camera.expect_name().return_const("MockCamera");
    camera
        .expect_setup()
        .returning(|ctx| Err(PipelineError::node(ctx.id(), "camera busy")));
    let resumes = Arc::clone(&counts.resumes);
    camera.expect_resume().returning(move |_| {
        resumes.fetch_add(1, Ordering::SeqCst);
    });
    let pauses = Arc::clone(&counts.pauses);
    camera.expect_pause().returning(move |_| {
        pauses.fetch_add(1, Ordering::SeqCst);
    });
    let releases = Arc::clone(&counts.releases);
    camera.expect_release().returning(move |_| {
        releases.fetch_add(1, Ordering::SeqCst);
    });
    camera
}

/// Register `failing_camera` bodies for `NodeType::Camera`.
pub fn with_failing_cameras(mut registry: NodeRegistry, counts: &HookCounts) -> NodeRegistry {
    let counts = counts.clone();
    registry.register(NodeType::Camera, move |_| Ok(AnyNode::plugin(failing_camera(&counts))));
    registry
}

/// A display that accepts its link but never reads a frame.
pub struct StalledDisplay;

impl NodeBehavior for StalledDisplay {
    fn name(&self) -> &'static str {
        "StalledDisplay"
    }
}

/// Register `StalledDisplay` bodies for `NodeType::Display`.
pub fn with_stalled_displays(mut registry: NodeRegistry) -> NodeRegistry {
    registry.register(NodeType::Display, |_| Ok(AnyNode::plugin(StalledDisplay)));
    registry
}
