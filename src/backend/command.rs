// Command pools and command recording
//
// The pool is tied to the graphics queue family. Frame command buffers are
// reset and re-recorded every frame; one-shot buffers (buffer copies) are
// allocated, submitted, waited on and freed in a single call.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::VulkanDevice;

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    handle: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Create a pool on the device's graphics queue family
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // TRANSIENT: short-lived buffers; RESET: per-buffer reset each frame
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let handle = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            handle,
            device: device.clone(),
        })
    }

    /// Allocate one primary command buffer
    pub fn allocate(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;

        buffers.into_iter().next().context("Driver returned no command buffer")
    }

    pub fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.handle, &[command_buffer])
        };
    }

    /// Record, submit and wait for a throwaway command buffer.
    ///
    /// Blocks until the graphics queue is idle. The buffer is freed on every
    /// path, including recording or submission failure.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandRecorder<'_>),
    {
        let command_buffer = self.allocate()?;
        let result = self.record_and_flush(command_buffer, record);
        self.free(command_buffer);
        result
    }

    fn record_and_flush<F>(&self, command_buffer: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&CommandRecorder<'_>),
    {
        let recorder = CommandRecorder::new(&self.device, command_buffer);
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&recorder);
        recorder.end()?;

        submit(&self.device, command_buffer, &[])?;
        self.device.wait_queue_idle()
    }

    /// Copy `src` into `dst` with a one-shot command buffer.
    ///
    /// The region covers the whole source, clamped to the destination size.
    /// Synchronous: meant for uploads, not per-frame use.
    pub fn buffer_copy(&self, src: &Buffer, dst: &Buffer) -> Result<()> {
        let size = copy_size(src.size(), dst.size());
        log::debug!("Copying {} bytes between buffers", size);

        self.one_shot(|recorder| recorder.copy_buffer(src, dst, size))
            .context("Buffer copy failed")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every command buffer allocated from the pool
        unsafe { self.device.device.destroy_command_pool(self.handle, None) };
    }
}

/// Bytes moved by a buffer copy: the source, clamped to the destination
pub fn copy_size(src: vk::DeviceSize, dst: vk::DeviceSize) -> vk::DeviceSize {
    src.min(dst)
}

/// Submit one command buffer to the graphics queue, signaling `signal` when
/// it finishes
pub fn submit(
    device: &VulkanDevice,
    command_buffer: vk::CommandBuffer,
    signal: &[vk::Semaphore],
) -> Result<()> {
    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::builder()
        .command_buffers(&command_buffers)
        .signal_semaphores(signal);

    unsafe {
        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())
    }
    .context("Failed to submit command buffer")
}

/// Thin recording helpers over a command buffer handle
pub struct CommandRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &'a VulkanDevice, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device: &device.device,
            command_buffer,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Discard previous contents; requires a RESET_COMMAND_BUFFER pool
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")
    }

    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(self.command_buffer, &begin_info) }
            .context("Failed to begin command buffer")
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.command_buffer) }
            .context("Failed to end command buffer")
    }

    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
    }

    /// Full-extent viewport and scissor
    pub fn set_viewport_and_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    pub fn bind_descriptor_set(&self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            )
        };
    }

    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[buffer], &[0])
        };
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.command_buffer, buffer, 0, index_type)
        };
    }

    pub fn draw_indexed(&self, index_count: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed(self.command_buffer, index_count, 1, 0, 0, 0)
        };
    }

    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src.handle(), dst.handle(), &[region])
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_covers_source_when_it_fits() {
        assert_eq!(copy_size(60, 60), 60);
        assert_eq!(copy_size(12, 4096), 12);
    }

    #[test]
    fn copy_clamps_to_destination() {
        // 64 KiB staging buffer feeding a three-vertex buffer
        assert_eq!(copy_size(64 * 1024, 60), 60);
    }
}
