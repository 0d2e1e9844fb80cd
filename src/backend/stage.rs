// Staged bring-up and teardown
//
// The Vulkan object graph is a strict chain: every object depends on the ones
// created before it. `VkStage` names each link and `StageSequencer` walks the
// chain forward on creation and backward on destruction.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;

/// One step of the Vulkan bring-up, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VkStage {
    Instance,
    DebugMessenger,
    Surface,
    PhysicalDevice,
    LogicalDevice,
    SwapChain,
    ImageViews,
    RenderPass,
    GraphicsPipeline,
    Framebuffers,
    CommandPool,
    VertexBuffer,
    CommandBuffers,
    SyncObjects,
}

impl VkStage {
    pub const ALL: [VkStage; 14] = [
        VkStage::Instance,
        VkStage::DebugMessenger,
        VkStage::Surface,
        VkStage::PhysicalDevice,
        VkStage::LogicalDevice,
        VkStage::SwapChain,
        VkStage::ImageViews,
        VkStage::RenderPass,
        VkStage::GraphicsPipeline,
        VkStage::Framebuffers,
        VkStage::CommandPool,
        VkStage::VertexBuffer,
        VkStage::CommandBuffers,
        VkStage::SyncObjects,
    ];

    /// Position in `ALL`
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            VkStage::Instance => "instance",
            VkStage::DebugMessenger => "debug messenger",
            VkStage::Surface => "surface",
            VkStage::PhysicalDevice => "physical device",
            VkStage::LogicalDevice => "logical device",
            VkStage::SwapChain => "swap chain",
            VkStage::ImageViews => "image views",
            VkStage::RenderPass => "render pass",
            VkStage::GraphicsPipeline => "graphics pipeline",
            VkStage::Framebuffers => "framebuffers",
            VkStage::CommandPool => "command pool",
            VkStage::VertexBuffer => "vertex buffer",
            VkStage::CommandBuffers => "command buffers",
            VkStage::SyncObjects => "sync objects",
        }
    }

    /// Stages that bake in the swap chain's images, format or extent and
    /// therefore have to be rebuilt together with it.
    pub fn is_swapchain_dependent(self) -> bool {
        matches!(
            self,
            VkStage::SwapChain
                | VkStage::ImageViews
                | VkStage::RenderPass
                | VkStage::GraphicsPipeline
                | VkStage::Framebuffers
                | VkStage::CommandBuffers
        )
    }
}

impl fmt::Display for VkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something that owns the objects for each stage.
pub trait StageResources {
    /// Create the objects for `stage`. Every earlier stage already exists.
    fn create_stage(&mut self, stage: VkStage) -> Result<()>;

    /// Destroy the objects for `stage`. Every later stage is already gone.
    fn destroy_stage(&mut self, stage: VkStage);
}

/// Tracks which stages exist and drives creation/destruction in order.
#[derive(Debug)]
pub struct StageSequencer {
    created: Vec<VkStage>,
    target: VkStage,
}

impl StageSequencer {
    /// Sequencer that builds up to and including `target`.
    pub fn new(target: VkStage) -> Self {
        Self {
            created: Vec::with_capacity(VkStage::ALL.len()),
            target,
        }
    }

    pub fn target(&self) -> VkStage {
        self.target
    }

    #[cfg(test)]
    pub fn created(&self) -> &[VkStage] {
        &self.created
    }

    pub fn last_created(&self) -> Option<VkStage> {
        self.created.last().copied()
    }

    pub fn is_created(&self, stage: VkStage) -> bool {
        // Created stages are always a prefix of ALL
        stage.index() < self.created.len()
    }

    /// Create every missing stage up to the target.
    ///
    /// On failure everything created so far is torn down again, so the
    /// resources are left empty.
    pub fn build<R: StageResources>(&mut self, resources: &mut R) -> Result<()> {
        let first = self.created.len();
        let last = self.target.index();

        for &stage in VkStage::ALL.iter().take(last + 1).skip(first) {
            log::debug!("Creating {}", stage);
            if let Err(e) = resources.create_stage(stage) {
                log::error!("Failed to create {}, tearing down", stage);
                self.teardown(resources);
                return Err(e).with_context(|| format!("Failed to create {}", stage));
            }
            self.created.push(stage);
        }

        log::info!("Vulkan bring-up reached stage: {}", self.target);
        Ok(())
    }

    /// Destroy every created stage, newest first.
    pub fn teardown<R: StageResources>(&mut self, resources: &mut R) {
        while let Some(stage) = self.created.pop() {
            log::debug!("Destroying {}", stage);
            resources.destroy_stage(stage);
        }
    }

    /// Destroy and recreate the swapchain-dependent stages.
    ///
    /// Independent stages in between (command pool, vertex buffer) are left
    /// alone. If a recreation fails, the stages after it are not recreated and
    /// the sequencer only reports what actually exists.
    pub fn rebuild_swapchain<R: StageResources>(&mut self, resources: &mut R) -> Result<()> {
        let dependent: Vec<VkStage> = self
            .created
            .iter()
            .copied()
            .filter(|stage| stage.is_swapchain_dependent())
            .collect();

        if dependent.is_empty() {
            return Ok(());
        }

        for &stage in dependent.iter().rev() {
            log::debug!("Destroying {} for rebuild", stage);
            resources.destroy_stage(stage);
        }

        for (i, &stage) in dependent.iter().enumerate() {
            log::debug!("Recreating {}", stage);
            if let Err(e) = resources.create_stage(stage) {
                // Drop this stage and everything after it from the record, and
                // destroy the independent stages that now sit above a hole.
                let cut = stage.index();
                let above: Vec<VkStage> = self.created.drain(cut..).collect();
                for &later in above.iter().rev() {
                    if !dependent[i..].contains(&later) {
                        resources.destroy_stage(later);
                    }
                }
                return Err(e).with_context(|| format!("Failed to recreate {}", stage));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(VkStage),
        Destroy(VkStage),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        fail_on: Option<VkStage>,
    }

    impl Recorder {
        fn failing(stage: VkStage) -> Self {
            Self {
                calls: Vec::new(),
                fail_on: Some(stage),
            }
        }

        fn created(&self) -> Vec<VkStage> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Create(s) => Some(*s),
                    Call::Destroy(_) => None,
                })
                .collect()
        }

        fn destroyed(&self) -> Vec<VkStage> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Destroy(s) => Some(*s),
                    Call::Create(_) => None,
                })
                .collect()
        }
    }

    impl StageResources for Recorder {
        fn create_stage(&mut self, stage: VkStage) -> Result<()> {
            if self.fail_on == Some(stage) {
                anyhow::bail!("boom");
            }
            self.calls.push(Call::Create(stage));
            Ok(())
        }

        fn destroy_stage(&mut self, stage: VkStage) {
            self.calls.push(Call::Destroy(stage));
        }
    }

    #[test]
    fn all_is_in_declaration_order() {
        for (i, stage) in VkStage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert!(VkStage::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn build_creates_every_stage_in_order() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::SyncObjects);
        seq.build(&mut res).unwrap();

        assert_eq!(res.created(), VkStage::ALL.to_vec());
        assert_eq!(seq.last_created(), Some(VkStage::SyncObjects));
        assert!(seq.is_created(VkStage::Instance));
    }

    #[test]
    fn build_stops_at_target() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::RenderPass);
        seq.build(&mut res).unwrap();

        assert_eq!(res.created().last(), Some(&VkStage::RenderPass));
        assert_eq!(res.created().len(), VkStage::RenderPass.index() + 1);
        assert!(!seq.is_created(VkStage::GraphicsPipeline));
    }

    #[test]
    fn build_twice_creates_nothing_new() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::Surface);
        seq.build(&mut res).unwrap();
        seq.build(&mut res).unwrap();

        assert_eq!(res.created().len(), 3);
    }

    #[test]
    fn failed_build_rolls_back_in_reverse() {
        let mut res = Recorder::failing(VkStage::LogicalDevice);
        let mut seq = StageSequencer::new(VkStage::SyncObjects);
        let err = seq.build(&mut res).unwrap_err();

        assert!(format!("{:#}", err).contains("logical device"));
        assert_eq!(
            res.destroyed(),
            vec![
                VkStage::PhysicalDevice,
                VkStage::Surface,
                VkStage::DebugMessenger,
                VkStage::Instance,
            ]
        );
        assert!(seq.created().is_empty());
    }

    #[test]
    fn teardown_is_reverse_of_creation_and_idempotent() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::SyncObjects);
        seq.build(&mut res).unwrap();
        seq.teardown(&mut res);
        seq.teardown(&mut res);

        let mut expected = VkStage::ALL.to_vec();
        expected.reverse();
        assert_eq!(res.destroyed(), expected);
        assert_eq!(seq.last_created(), None);
    }

    #[test]
    fn rebuild_touches_only_swapchain_dependent_stages() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::SyncObjects);
        seq.build(&mut res).unwrap();
        res.calls.clear();

        seq.rebuild_swapchain(&mut res).unwrap();

        assert_eq!(
            res.calls,
            vec![
                Call::Destroy(VkStage::CommandBuffers),
                Call::Destroy(VkStage::Framebuffers),
                Call::Destroy(VkStage::GraphicsPipeline),
                Call::Destroy(VkStage::RenderPass),
                Call::Destroy(VkStage::ImageViews),
                Call::Destroy(VkStage::SwapChain),
                Call::Create(VkStage::SwapChain),
                Call::Create(VkStage::ImageViews),
                Call::Create(VkStage::RenderPass),
                Call::Create(VkStage::GraphicsPipeline),
                Call::Create(VkStage::Framebuffers),
                Call::Create(VkStage::CommandBuffers),
            ]
        );
        assert_eq!(seq.created(), &VkStage::ALL[..]);
    }

    #[test]
    fn rebuild_before_swap_chain_is_a_no_op() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::LogicalDevice);
        seq.build(&mut res).unwrap();
        res.calls.clear();

        seq.rebuild_swapchain(&mut res).unwrap();
        assert!(res.calls.is_empty());
    }

    #[test]
    fn failed_rebuild_drops_everything_above_the_hole() {
        let mut res = Recorder::default();
        let mut seq = StageSequencer::new(VkStage::SyncObjects);
        seq.build(&mut res).unwrap();
        res.calls.clear();
        res.fail_on = Some(VkStage::GraphicsPipeline);

        assert!(seq.rebuild_swapchain(&mut res).is_err());
        assert_eq!(seq.last_created(), Some(VkStage::RenderPass));

        // Independent stages above the failure are destroyed exactly once
        let destroyed = res.destroyed();
        for stage in [VkStage::SyncObjects, VkStage::VertexBuffer, VkStage::CommandPool] {
            assert_eq!(destroyed.iter().filter(|&&s| s == stage).count(), 1);
        }

        // A later teardown only touches what is still recorded
        res.calls.clear();
        seq.teardown(&mut res);
        assert_eq!(res.destroyed().first(), Some(&VkStage::RenderPass));
        assert_eq!(res.destroyed().len(), VkStage::RenderPass.index() + 1);
    }

    #[test]
    fn stage_names_deserialize_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            stage: VkStage,
        }

        let w: Wrapper = toml::from_str(r#"stage = "graphics_pipeline""#).unwrap();
        assert_eq!(w.stage, VkStage::GraphicsPipeline);
        assert!(toml::from_str::<Wrapper>(r#"stage = "warp_drive""#).is_err());
    }
}
