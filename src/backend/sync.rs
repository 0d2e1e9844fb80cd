// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync, plus the bookkeeping
// for which frame slot is current and which swap-chain image each slot uses.

use anyhow::{Context, Result};
use ash::vk;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(s) => s,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(f) => f,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Ring of frames in flight
#[derive(Debug)]
pub struct FrameRing {
    frames: Vec<FrameSync>,
    /// Fence of the frame currently using each swap-chain image, null if none
    images_in_flight: Vec<vk::Fence>,
    current: usize,
}

impl FrameRing {
    pub fn new(device: &ash::Device, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in &frames {
                        frame.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        Self::from_frames(frames, image_count)
    }

    /// `current` and `advance` index into `frames`, so it must not be empty
    fn from_frames(frames: Vec<FrameSync>, image_count: usize) -> Result<Self> {
        if frames.is_empty() {
            anyhow::bail!("At least one frame in flight is required");
        }

        Ok(Self {
            frames,
            images_in_flight: vec![vk::Fence::null(); image_count],
            current: 0,
        })
    }

    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    /// Mark `image_index` as owned by the current frame.
    ///
    /// Returns the fence of the frame that used the image before, if any, so
    /// the caller can wait on it before reusing the image.
    pub fn claim_image(&mut self, image_index: u32) -> Option<vk::Fence> {
        let fence = self.frames[self.current].in_flight_fence;
        let slot = self.images_in_flight.get_mut(image_index as usize)?;
        let previous = std::mem::replace(slot, fence);

        if previous == vk::Fence::null() || previous == fence {
            None
        } else {
            Some(previous)
        }
    }

    /// Forget image ownership after the swap chain changed
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, vk::Fence::null());
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    pub fn destroy(&self, device: &ash::Device) {
        for frame in &self.frames {
            frame.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_frame(n: u64) -> FrameSync {
        FrameSync {
            image_available: vk::Semaphore::from_raw(n * 10 + 1),
            render_finished: vk::Semaphore::from_raw(n * 10 + 2),
            in_flight_fence: vk::Fence::from_raw(n * 10 + 3),
        }
    }

    fn ring(frames: u64, images: usize) -> FrameRing {
        FrameRing::from_frames((0..frames).map(fake_frame).collect(), images).unwrap()
    }

    #[test]
    fn empty_ring_is_rejected() {
        assert!(FrameRing::from_frames(Vec::new(), 3).is_err());
    }

    #[test]
    fn advance_wraps_around() {
        let mut ring = ring(2, 3);
        let first = ring.current().in_flight_fence;
        ring.advance();
        assert_ne!(ring.current().in_flight_fence, first);
        ring.advance();
        assert_eq!(ring.current().in_flight_fence, first);
    }

    #[test]
    fn first_claim_has_nothing_to_wait_for() {
        let mut ring = ring(2, 3);
        assert_eq!(ring.claim_image(1), None);
    }

    #[test]
    fn claiming_an_image_used_by_another_frame_returns_its_fence() {
        let mut ring = ring(2, 3);
        let first_fence = ring.current().in_flight_fence;
        ring.claim_image(2);
        ring.advance();

        assert_eq!(ring.claim_image(2), Some(first_fence));
        // Now owned by frame 1; frame 1 reclaiming it waits on nothing extra
        assert_eq!(ring.claim_image(2), None);
    }

    #[test]
    fn reset_forgets_ownership() {
        let mut ring = ring(2, 2);
        ring.claim_image(0);
        ring.advance();
        ring.reset_images(4);

        assert_eq!(ring.claim_image(0), None);
        assert_eq!(ring.claim_image(3), None);
    }

    #[test]
    fn out_of_range_image_is_ignored() {
        let mut ring = ring(1, 2);
        assert_eq!(ring.claim_image(7), None);
    }
}
