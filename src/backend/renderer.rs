// Renderer - the per-frame loop
//
// One frame in flight, strictly sequential:
//
//   begin_draw: acquire image (wait on fence) → reset + begin command buffer
//               → begin render pass → bind pipeline + descriptor set
//   draw:       bind vertex/index buffers → indexed draw
//   end_draw:   end render pass + command buffer → submit → present
//               → wait for the queue to go idle
//
// Nothing overlaps between frames, so a single command buffer and a single
// set of sync objects are enough.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{Buffer, IndexBuffer, VertexBuffer};
use super::command::{self, CommandPool, CommandRecorder};
use super::descriptor::DescriptorSet;
use super::frame::{Frame, FrameSequencer, Presenter};
use super::pipeline::{Pipeline, RenderPass, Vertex};
use super::swapchain::{AcquireOutcome, PresentOutcome, Swapchain, SwapchainCreationInfo};
use super::sync::FrameSync;
use super::VulkanDevice;

pub struct Renderer {
    sequencer: FrameSequencer,
    /// Frame being recorded between begin_draw and end_draw
    recording: Option<Frame>,
    clear_color: [f32; 4],

    command_buffer: vk::CommandBuffer,
    command_pool: CommandPool,
    presentation: Presentation,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Create the render pass, swapchain and per-frame objects for the
    /// device's connected surface
    pub fn new(
        device: &Arc<VulkanDevice>,
        present_mode: vk::PresentModeKHR,
        clear_color: [f32; 4],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Initializing renderer ({}x{})", width, height);

        let info = SwapchainCreationInfo::query(device)?
            .context("GPU cannot present to this surface")?;
        let render_pass = RenderPass::new(device, info.surface_format().format)?;

        // A minimized window gets its swapchain on the first frame with area
        let (swapchain, sequencer) = if width > 0 && height > 0 {
            let swapchain = Swapchain::new(
                device.clone(),
                &info,
                &render_pass,
                width,
                height,
                present_mode,
                0,
            )?;
            (Some(swapchain), FrameSequencer::new(0))
        } else {
            (None, FrameSequencer::without_swapchain())
        };

        let presentation = Presentation {
            sync: FrameSync::new(device)?,
            swapchain,
            render_pass,
            present_mode,
            surface_extent: (width, height),
            device: device.clone(),
        };

        let command_pool = CommandPool::new(device)?;
        let command_buffer = command_pool.allocate()?;

        Ok(Self {
            sequencer,
            recording: None,
            clear_color,
            command_buffer,
            command_pool,
            presentation,
            device: device.clone(),
        })
    }

    /// Record a new window size. The swapchain is rebuilt at the start of
    /// the next frame, never under a frame that is being recorded.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        if self.presentation.surface_extent == (width, height) {
            return;
        }
        log::debug!("Surface resized to {}x{}", width, height);
        self.presentation.surface_extent = (width, height);
        self.sequencer.request_rebuild();
    }

    /// Start a frame: acquire an image and begin recording with `pipeline`
    /// and `descriptor_set` bound.
    ///
    /// Returns false (and records nothing) while the surface has no area.
    pub fn begin_draw(&mut self, pipeline: &Pipeline, descriptor_set: DescriptorSet) -> Result<bool> {
        assert!(self.recording.is_none(), "begin_draw called twice without end_draw");

        let (width, height) = self.presentation.surface_extent;
        if width == 0 || height == 0 {
            return Ok(false);
        }

        let frame = self.sequencer.acquire(&mut self.presentation)?;
        let swapchain = self.presentation.swapchain()?;
        let extent = swapchain.extent();

        let recorder = CommandRecorder::new(&self.device, self.command_buffer);
        recorder.reset()?;
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        recorder.begin_render_pass(
            self.presentation.render_pass.handle(),
            swapchain.framebuffer(&frame),
            extent,
            self.clear_color,
        );
        recorder.set_viewport_and_scissor(extent);
        recorder.bind_pipeline(pipeline.handle());
        recorder.bind_descriptor_set(pipeline.layout(), descriptor_set.handle());

        self.recording = Some(frame);
        Ok(true)
    }

    /// Draw every index of `indices`. No-op outside begin_draw/end_draw.
    pub fn draw<V: Vertex>(&mut self, vertices: &VertexBuffer<V>, indices: &IndexBuffer) {
        self.draw_indexed(vertices.as_ref(), indices);
    }

    pub(crate) fn draw_indexed(&mut self, vertices: &Buffer, indices: &IndexBuffer) {
        if self.recording.is_none() {
            return;
        }

        let recorder = CommandRecorder::new(&self.device, self.command_buffer);
        recorder.bind_vertex_buffer(vertices.handle());
        recorder.bind_index_buffer(indices.as_ref().handle(), IndexBuffer::INDEX_TYPE);
        recorder.draw_indexed(indices.len() as u32);
    }

    /// Finish the frame: submit, present and wait for the GPU.
    ///
    /// Returns None when no frame was being recorded.
    pub fn end_draw(&mut self) -> Result<Option<PresentOutcome>> {
        let Some(frame) = self.recording.take() else {
            return Ok(None);
        };

        let recorder = CommandRecorder::new(&self.device, self.command_buffer);
        recorder.end_render_pass();
        recorder.end()?;

        command::submit(
            &self.device,
            self.command_buffer,
            &[self.presentation.sync.render_finished],
        )?;

        let outcome = self.sequencer.present(&mut self.presentation, frame)?;

        // Blocking per-frame sync: the next frame reuses everything
        self.device.wait_queue_idle()?;

        Ok(Some(outcome))
    }

    /// Synchronous copy of `src` into `dst` (see [`CommandPool::buffer_copy`])
    pub fn buffer_copy(&self, src: &impl AsRef<Buffer>, dst: &impl AsRef<Buffer>) -> Result<()> {
        self.command_pool.buffer_copy(src.as_ref(), dst.as_ref())
    }

    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Render pass every pipeline drawn by this renderer must be built for
    pub fn render_pass(&self) -> &RenderPass {
        &self.presentation.render_pass
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.sequencer.rebuild_count()
    }

    pub fn frames_presented(&self) -> u64 {
        self.sequencer.frames_presented()
    }

    pub fn swapchain_generation(&self) -> u64 {
        self.sequencer.generation()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Renderer teardown without idle device: {:?}", e);
        }
    }
}

// =============================================================================
// PRESENTATION
// =============================================================================

/// Swapchain plus everything a rebuild needs. Field order is drop order.
struct Presentation {
    sync: FrameSync,
    swapchain: Option<Swapchain>,
    render_pass: RenderPass,
    present_mode: vk::PresentModeKHR,
    surface_extent: (u32, u32),
    device: Arc<VulkanDevice>,
}

impl Presentation {
    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }
}

impl Presenter for Presentation {
    fn acquire(&mut self) -> Result<Option<u32>> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(None);
        };

        match swapchain.acquire_next_image(self.sync.image_acquired)? {
            AcquireOutcome::Ready(index) => {
                self.sync.wait_for_image()?;
                Ok(Some(index))
            }
            // The fence still signals; drain it before the image is dropped
            AcquireOutcome::Suboptimal(_) => {
                self.sync.wait_for_image()?;
                Ok(None)
            }
            AcquireOutcome::OutOfDate => Ok(None),
        }
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
        self.swapchain()?.present(
            self.device.graphics_queue,
            image_index,
            &[self.sync.render_finished],
        )
    }

    fn rebuild(&mut self, generation: u64) -> Result<()> {
        let (width, height) = self.surface_extent;
        log::debug!("Rebuilding swapchain for {}x{}", width, height);

        // Wait for the GPU to finish before destroying anything
        self.device.wait_idle()?;

        // The surface can only have one swapchain at a time
        self.swapchain = None;

        let info = SwapchainCreationInfo::query(&self.device)?
            .context("GPU can no longer present to this surface")?;

        // Pipelines are baked against the render pass format
        let format = info.surface_format().format;
        if format != self.render_pass.format() {
            anyhow::bail!(
                "Surface format changed from {:?} to {:?}",
                self.render_pass.format(),
                format
            );
        }

        self.swapchain = Some(Swapchain::new(
            self.device.clone(),
            &info,
            &self.render_pass,
            width,
            height,
            self.present_mode,
            generation,
        )?);

        // An out-of-date present may have left the semaphore signaled
        self.sync.renew_render_finished()
    }
}
