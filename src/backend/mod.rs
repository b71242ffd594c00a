// Backend module - Vulkan abstraction layer
//
// Design: Thin wrappers around ash that own their handles
// Lifetime: every resource holds an Arc<VulkanDevice> and releases its handles
// in Drop, so the device is always destroyed last

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{
    Buffer, BufferUsage, Index, IndexBuffer, ReadbackBuffer, StagingBuffer, UniformBuffer,
    VertexBuffer,
};
pub use command::CommandPool;
pub use descriptor::{DescriptorPool, DescriptorSet};
pub use device::VulkanDevice;
pub use frame::{Frame, FrameSequencer, Presenter};
pub use pipeline::{Pipeline, PipelineDesc, RenderPass, UniformBinding, Vertex, VertexAttribute};
pub use renderer::Renderer;
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain, SwapchainCreationInfo};
