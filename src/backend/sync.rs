// Synchronization primitives
//
// One frame in flight: a fence the CPU waits on after acquiring an image, and
// a semaphore the submission signals for presentation.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization for the single in-flight frame
pub struct FrameSync {
    /// Signaled when the acquired image is ready to be rendered to
    pub image_acquired: vk::Fence,
    /// Signaled when rendering finished; presentation waits on it
    pub render_finished: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::builder(); // Start unsignaled

        let image_acquired = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;

        let render_finished = match create_semaphore(device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_fence(image_acquired, None) };
                return Err(e);
            }
        };

        Ok(Self {
            image_acquired,
            render_finished,
            device: device.clone(),
        })
    }

    /// Block until the acquire fence signals, then reset it
    pub fn wait_for_image(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.image_acquired], true, u64::MAX)
                .context("Failed waiting for image acquisition")?;
            self.device
                .device
                .reset_fences(&[self.image_acquired])
                .context("Failed to reset acquire fence")?;
        }
        Ok(())
    }

    /// Swap in a fresh render-finished semaphore.
    ///
    /// A present that reports out-of-date may leave the old one signaled.
    /// Only call with the device idle.
    pub fn renew_render_finished(&mut self) -> Result<()> {
        let fresh = create_semaphore(&self.device)?;
        let old = std::mem::replace(&mut self.render_finished, fresh);
        unsafe { self.device.device.destroy_semaphore(old, None) };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.image_acquired, None);
        }
    }
}

fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}
