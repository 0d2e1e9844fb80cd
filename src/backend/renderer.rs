// Renderer - stage sequencing plus the present loop
//
// FRAME FLOW:
// 1. Wait for the current frame slot's fence
// 2. Acquire a swap-chain image (rebuild if out of date)
// 3. Wait for whichever frame last used that image
// 4. Submit the image's pre-recorded command buffer
// 5. Present, rebuilding the swap chain if it became stale
// 6. Advance to the next frame slot

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use super::context::{FrameParts, RendererSettings, VulkanContext};
use super::stage::{StageSequencer, VkStage};

/// What happened on a call to `draw_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was submitted and presented
    Presented,
    /// The swap chain was stale; it has been rebuilt and no frame was drawn
    Rebuilt,
    /// Window is minimized, nothing to draw into
    Minimized,
    /// Bring-up stopped before the present loop can run
    Idle,
}

/// What `draw_frame` does before touching the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameAction {
    /// Nothing to draw this time
    Skip(FrameStatus),
    /// Rebuild the swap chain first, then draw
    RecreateThenDraw,
    Draw,
}

/// A pending resize stays pending while the window is minimized.
fn next_action(can_present: bool, minimized: bool, resized: bool) -> FrameAction {
    if !can_present {
        FrameAction::Skip(FrameStatus::Idle)
    } else if minimized {
        FrameAction::Skip(FrameStatus::Minimized)
    } else if resized {
        FrameAction::RecreateThenDraw
    } else {
        FrameAction::Draw
    }
}

/// Status of a frame skipped because acquisition found the swap chain out of
/// date. `deferred` means the rebuild was postponed (zero-sized window).
fn status_after_rebuild(deferred: bool) -> FrameStatus {
    if deferred {
        FrameStatus::Minimized
    } else {
        FrameStatus::Rebuilt
    }
}

pub struct Renderer {
    sequencer: StageSequencer,
    context: VulkanContext,
    /// Set by the window on resize; forces a rebuild before the next frame
    framebuffer_resized: bool,
}

impl Renderer {
    /// Bring Vulkan up to the configured final stage
    pub fn new(window: Arc<Window>, settings: RendererSettings) -> Result<Self> {
        log::info!("Initializing Vulkan up to stage: {}", settings.final_stage);

        let mut sequencer = StageSequencer::new(settings.final_stage);
        let mut context = VulkanContext::new(window, settings)?;
        sequencer.build(&mut context)?;

        Ok(Self {
            sequencer,
            context,
            framebuffer_resized: false,
        })
    }

    /// Stage the bring-up was configured to stop at
    pub fn final_stage(&self) -> VkStage {
        self.sequencer.target()
    }

    pub fn reached(&self) -> Option<VkStage> {
        self.sequencer.last_created()
    }

    /// Whether every stage the present loop needs exists
    pub fn can_present(&self) -> bool {
        self.sequencer.is_created(VkStage::SyncObjects)
    }

    pub fn mark_resized(&mut self) {
        self.framebuffer_resized = true;
    }

    fn is_minimized(&self) -> bool {
        let (width, height) = self.context.window_size();
        width == 0 || height == 0
    }

    /// Wait for the GPU, then rebuild everything tied to the swap chain
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        if self.is_minimized() {
            // Zero-sized swap chains are invalid; try again once restored
            self.framebuffer_resized = true;
            return Ok(());
        }

        self.context.device()?.wait_idle()?;
        self.sequencer
            .rebuild_swapchain(&mut self.context)
            .context("Failed to recreate swap chain")?;

        let image_count = self.context.swapchain()?.images.len();
        if let Ok(frames) = self.context.frames_mut() {
            frames.reset_images(image_count);
        }

        self.framebuffer_resized = false;
        log::info!("Swap chain recreated with {} images", image_count);
        Ok(())
    }

    /// Render a single frame.
    pub fn draw_frame(&mut self) -> Result<FrameStatus> {
        match next_action(self.can_present(), self.is_minimized(), self.framebuffer_resized) {
            FrameAction::Skip(status) => return Ok(status),
            FrameAction::RecreateThenDraw => {
                self.recreate_swapchain()?;
                if self.framebuffer_resized {
                    return Ok(FrameStatus::Minimized);
                }
            }
            FrameAction::Draw => {}
        }

        let needs_rebuild = match self.submit_and_present()? {
            Some(stale) => stale,
            None => {
                self.recreate_swapchain()?;
                return Ok(status_after_rebuild(self.framebuffer_resized));
            }
        };

        if needs_rebuild || self.framebuffer_resized {
            self.recreate_swapchain()?;
        }

        Ok(FrameStatus::Presented)
    }

    /// One trip through the frame ring.
    ///
    /// `None` if acquisition found the swap chain out of date (nothing was
    /// submitted), otherwise whether presentation reported it stale.
    fn submit_and_present(&mut self) -> Result<Option<bool>> {
        let FrameParts {
            device,
            swapchain,
            command_buffers,
            frames,
        } = self.context.frame_parts()?;
        let frame = *frames.current();
        let vk_device = &device.device;

        unsafe {
            vk_device
                .wait_for_fences(&[frame.in_flight_fence], true, u64::MAX)
                .context("Failed to wait for in-flight fence")?;
        }

        let (image_index, suboptimal) = match swapchain.acquire_next_image(frame.image_available)? {
            Some(acquired) => acquired,
            None => return Ok(None),
        };

        // A previous frame may still be rendering into this image
        if let Some(previous) = frames.claim_image(image_index) {
            unsafe {
                vk_device
                    .wait_for_fences(&[previous], true, u64::MAX)
                    .context("Failed to wait for image fence")?;
            }
        }

        let cmd = *command_buffers
            .get(image_index as usize)
            .with_context(|| format!("No command buffer for image {}", image_index))?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_command_buffers = [cmd];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&submit_command_buffers)
            .signal_semaphores(&signal_semaphores);

        // Reset only once we know work will be submitted, or the next wait
        // on this fence would block forever
        unsafe {
            vk_device
                .reset_fences(&[frame.in_flight_fence])
                .context("Failed to reset in-flight fence")?;
            vk_device
                .queue_submit(
                    device.graphics_queue,
                    &[submit_info.build()],
                    frame.in_flight_fence,
                )
                .context("Failed to submit draw command buffer")?;
        }

        let stale = swapchain.present(device.present_queue, image_index, &signal_semaphores)?;

        frames.advance();

        Ok(Some(suboptimal || stale))
    }

    pub fn wait_idle(&self) -> Result<()> {
        match self.context.device() {
            Ok(device) => device.wait_idle(),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Err(e) = self.wait_idle() {
            log::warn!("Failed to wait for device before cleanup: {:?}", e);
        }
        self.sequencer.teardown(&mut self.context);

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_is_drawn_before_sync_objects_exist() {
        for (minimized, resized) in [(false, false), (true, false), (false, true), (true, true)] {
            assert_eq!(
                next_action(false, minimized, resized),
                FrameAction::Skip(FrameStatus::Idle)
            );
        }
    }

    #[test]
    fn minimized_window_skips_drawing() {
        assert_eq!(
            next_action(true, true, false),
            FrameAction::Skip(FrameStatus::Minimized)
        );
    }

    #[test]
    fn resize_while_minimized_stays_deferred() {
        let mut resized = true;

        // Still minimized: skipped, and nothing clears the pending resize
        assert_eq!(
            next_action(true, true, resized),
            FrameAction::Skip(FrameStatus::Minimized)
        );
        assert_eq!(
            next_action(true, true, resized),
            FrameAction::Skip(FrameStatus::Minimized)
        );

        // Restored: the deferred rebuild runs before drawing
        assert_eq!(next_action(true, false, resized), FrameAction::RecreateThenDraw);

        resized = false;
        assert_eq!(next_action(true, false, resized), FrameAction::Draw);
    }

    #[test]
    fn resize_flag_forces_rebuild() {
        assert_eq!(next_action(true, false, true), FrameAction::RecreateThenDraw);
        assert_eq!(next_action(true, false, false), FrameAction::Draw);
    }

    #[test]
    fn out_of_date_acquire_reports_rebuild_or_deferral() {
        assert_eq!(status_after_rebuild(false), FrameStatus::Rebuilt);
        assert_eq!(status_after_rebuild(true), FrameStatus::Minimized);
    }
}
