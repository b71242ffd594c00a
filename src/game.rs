// =============================================================================
// GAME SCAFFOLD
// =============================================================================
//
// Ties the window, the device and the renderer together behind one object:
//
//   let mut game = Game::new(config)?;
//   while game.poll() {
//       if game.begin_draw(&pipeline, set)? {
//           game.draw_mesh(key);
//           game.end_draw()?;
//       }
//   }
//
// poll() drains window events first, so a resize always reaches the renderer
// before the next swapchain-dependent call.

use anyhow::Result;
use bytemuck::Pod;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::keyboard::KeyCode;

use crate::backend::{
    Buffer, DescriptorPool, DescriptorSet, Index, IndexBuffer, Pipeline, PipelineDesc,
    PresentOutcome, ReadbackBuffer, Renderer, StagingBuffer, UniformBuffer, Vertex, VertexBuffer,
    VulkanDevice,
};
use crate::config::Config;
use crate::mesh::{Mesh, MeshKey, MeshStore};
use crate::window::Window;

/// Window + GPU + frame loop.
///
/// IMPORTANT: Field order matters for Drop! GPU resources go first, then the
/// device, and the window last since the surface belongs to it.
pub struct Game {
    meshes: MeshStore,
    renderer: Renderer,
    device: Arc<VulkanDevice>,
    window: Window,

    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // FRAME TIMING
    // ─────────────────────────────────────────────────────────────────────────
    last_frame_time: Instant,
    delta: Duration,
    frame_count: u32,
    last_fps_update: Instant,

    /// Left button state at the previous poll
    was_clicking: bool,
}

impl Game {
    /// Open the window and bring up Vulkan on it
    pub fn new(config: Config) -> Result<Self> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Window
        // ─────────────────────────────────────────────────────────────────────
        let window = Window::new(&config.window)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Vulkan device with the window's surface extensions
        // ─────────────────────────────────────────────────────────────────────
        let extensions = window.required_extensions()?;
        let mut device = VulkanDevice::new(
            &config.window.title,
            &extensions,
            config.validation_enabled(),
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Surface (platform-specific window connection)
        // ─────────────────────────────────────────────────────────────────────
        let surface = window.create_surface(&device)?;
        device.connect_to_surface(surface)?;
        let device = Arc::new(device);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Swapchain, render pass and frame objects
        // ─────────────────────────────────────────────────────────────────────
        let renderer = Renderer::new(
            &device,
            config.get_present_mode(),
            config.graphics.clear_color,
            window.width(),
            window.height(),
        )?;

        log::info!("Vulkan initialized successfully!");

        let now = Instant::now();
        Ok(Self {
            meshes: MeshStore::new(),
            renderer,
            device,
            window,
            config,
            last_frame_time: now,
            delta: Duration::ZERO,
            frame_count: 0,
            last_fps_update: now,
            was_clicking: false,
        })
    }

    /// Process window events and advance the frame clock. Returns false once
    /// the window has been closed.
    pub fn poll(&mut self) -> bool {
        self.was_clicking = self.window.left_clicking();

        if !self.window.poll() {
            return false;
        }

        if let Some((width, height)) = self.window.take_resize() {
            self.renderer.notify_resized(width, height);
        }

        let now = Instant::now();
        self.delta = now.duration_since(self.last_frame_time);
        self.last_frame_time = now;
        self.update_fps(now);

        true
    }

    fn update_fps(&mut self, now: Instant) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let mode = if self.window.is_fullscreen() { "fullscreen" } else { "windowed" };
            self.window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title,
                fps,
                self.delta.as_secs_f32() * 1000.0,
                mode
            ));
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    // =========================================================================
    // INPUT
    // =========================================================================

    pub fn width(&self) -> u32 {
        self.window.width()
    }

    pub fn height(&self) -> u32 {
        self.window.height()
    }

    pub fn mouse_x(&self) -> f32 {
        self.window.mouse_x()
    }

    pub fn mouse_y(&self) -> f32 {
        self.window.mouse_y()
    }

    pub fn delta_mouse(&self) -> (f32, f32) {
        self.window.delta_mouse()
    }

    pub fn left_clicking(&self) -> bool {
        self.window.left_clicking()
    }

    /// True only on the poll where the left button went down
    pub fn left_clicked_now(&self) -> bool {
        self.window.left_clicking() && !self.was_clicking
    }

    pub fn is_key_down(&self, key: KeyCode) -> bool {
        self.window.is_key_down(key)
    }

    /// Seconds between the last two polls
    pub fn delta(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn window_mut(&mut self) -> &mut Window {
        &mut self.window
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    /// Build a pipeline for `V` against the swapchain's render pass
    pub fn create_pipeline<V: Vertex>(&self, desc: &PipelineDesc) -> Result<Pipeline> {
        Pipeline::new::<V>(&self.device, self.renderer.render_pass(), desc)
    }

    /// Descriptor pool for `pipeline`, sized by `graphics.descriptor_pool_capacity`
    pub fn create_descriptor_pool(&self, pipeline: &Pipeline) -> Result<DescriptorPool> {
        DescriptorPool::new(
            &self.device,
            pipeline,
            self.config.graphics.descriptor_pool_capacity,
        )
    }

    pub fn create_staging_buffer(&self, size: u64) -> Result<StagingBuffer> {
        StagingBuffer::new(&self.device, size)
    }

    pub fn create_uniform_buffer<T: Pod>(&self, count: usize) -> Result<UniformBuffer<T>> {
        UniformBuffer::new(&self.device, count)
    }

    pub fn create_vertex_buffer<V: Vertex>(&self, count: usize) -> Result<VertexBuffer<V>> {
        VertexBuffer::new(&self.device, count)
    }

    pub fn create_index_buffer(&self, count: usize) -> Result<IndexBuffer> {
        IndexBuffer::new(&self.device, count)
    }

    pub fn create_readback_buffer(&self, size: u64) -> Result<ReadbackBuffer> {
        ReadbackBuffer::new(&self.device, size)
    }

    /// Synchronous GPU copy; for uploads, not per-frame use
    pub fn buffer_copy(&self, src: &impl AsRef<Buffer>, dst: &impl AsRef<Buffer>) -> Result<()> {
        self.renderer.buffer_copy(src, dst)
    }

    // =========================================================================
    // MESHES
    // =========================================================================

    pub fn create_mesh<V: Vertex>(&mut self, vertices: &[V], indices: &[Index]) -> Result<MeshKey> {
        let mesh = Mesh::upload(&self.device, self.renderer.command_pool(), vertices, indices)?;
        Ok(self.meshes.insert(mesh))
    }

    /// Panics if called between begin_draw and end_draw, or with a stale key
    pub fn release_mesh(&mut self, key: MeshKey) {
        assert!(
            !self.renderer.is_recording(),
            "release_mesh called while a frame is being recorded"
        );
        self.meshes.release(key);
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// See [`Renderer::begin_draw`]
    pub fn begin_draw(&mut self, pipeline: &Pipeline, descriptor_set: DescriptorSet) -> Result<bool> {
        self.renderer.begin_draw(pipeline, descriptor_set)
    }

    pub fn draw<V: Vertex>(&mut self, vertices: &VertexBuffer<V>, indices: &IndexBuffer) {
        self.renderer.draw(vertices, indices);
    }

    pub fn draw_mesh(&mut self, key: MeshKey) {
        let mesh = self.meshes.get(key);
        self.renderer.draw_indexed(mesh.vertices(), mesh.indices());
    }

    pub fn end_draw(&mut self) -> Result<Option<PresentOutcome>> {
        self.renderer.end_draw()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.renderer.rebuild_count()
    }

    pub fn frames_presented(&self) -> u64 {
        self.renderer.frames_presented()
    }
}

impl Drop for Game {
    fn drop(&mut self) {
        log::info!(
            "Shutting down after {} frames ({} swapchain rebuilds)",
            self.renderer.frames_presented(),
            self.renderer.rebuild_count()
        );
        // Fields drop after this, so no mesh buffer is still in flight
        let _ = self.device.wait_idle();
    }
}
