// Graphics pipeline creation and management
//
// One render pass (a single color attachment: the swapchain image) and
// graphics pipelines built against it. A pipeline is immutable once built:
// one vertex + one fragment stage, triangle lists, viewport and scissor
// supplied as dynamic state at record time.

use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

use super::shader::Shader;
use super::VulkanDevice;

// =============================================================================
// RENDER PASS
// =============================================================================

/// Render pass with one color attachment that is cleared and then presented
pub struct RenderPass {
    handle: vk::RenderPass,
    format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    pub fn new(device: &Arc<VulkanDevice>, format: vk::Format) -> Result<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .build();

        // Wait for the presentation engine to release the image before writing
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();

        let attachments = &[color_attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        log::debug!("Created render pass for {:?}", format);

        Ok(Self {
            handle,
            format,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Color format the pass (and every pipeline built on it) expects
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

// =============================================================================
// VERTEX LAYOUT
// =============================================================================

/// One vertex attribute: its shape and byte offset inside the vertex struct.
/// Its position in [`Vertex::ATTRIBUTES`] is its shader location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub format: vk::Format,
    pub offset: u32,
}

impl VertexAttribute {
    pub const fn float(offset: usize) -> Self {
        Self::new(vk::Format::R32_SFLOAT, offset)
    }

    pub const fn vec2(offset: usize) -> Self {
        Self::new(vk::Format::R32G32_SFLOAT, offset)
    }

    pub const fn vec3(offset: usize) -> Self {
        Self::new(vk::Format::R32G32B32_SFLOAT, offset)
    }

    pub const fn vec4(offset: usize) -> Self {
        Self::new(vk::Format::R32G32B32A32_SFLOAT, offset)
    }

    pub const fn new(format: vk::Format, offset: usize) -> Self {
        Self {
            format,
            offset: offset as u32,
        }
    }
}

/// A vertex type usable with [`Pipeline::new`].
///
/// The attribute list must match the vertex shader's inputs; nothing checks
/// it against the SPIR-V.
///
/// ```ignore
/// #[repr(C)]
/// #[derive(Clone, Copy, Pod, Zeroable)]
/// struct ColorVertex { pos: Vec2, color: Vec3 }
///
/// impl Vertex for ColorVertex {
///     const ATTRIBUTES: &'static [VertexAttribute] = &[
///         VertexAttribute::vec2(std::mem::offset_of!(ColorVertex, pos)),
///         VertexAttribute::vec3(std::mem::offset_of!(ColorVertex, color)),
///     ];
/// }
/// ```
pub trait Vertex: bytemuck::Pod {
    const ATTRIBUTES: &'static [VertexAttribute];
}

/// Binding 0, advancing per vertex by `size_of::<V>()`
pub fn vertex_binding_description<V: Vertex>() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<V>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// One description per attribute, location = position in the list
pub fn vertex_attribute_descriptions<V: Vertex>() -> Vec<vk::VertexInputAttributeDescription> {
    V::ATTRIBUTES
        .iter()
        .enumerate()
        .map(|(location, attribute)| vk::VertexInputAttributeDescription {
            location: location as u32,
            binding: 0,
            format: attribute.format,
            offset: attribute.offset,
        })
        .collect()
}

// =============================================================================
// PIPELINE
// =============================================================================

/// A uniform buffer binding declared by the shaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

impl UniformBinding {
    pub const fn vertex(binding: u32) -> Self {
        Self {
            binding,
            stages: vk::ShaderStageFlags::VERTEX,
        }
    }

    pub const fn fragment(binding: u32) -> Self {
        Self {
            binding,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Inputs for [`Pipeline::new`]
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub uniforms: Vec<UniformBinding>,
}

/// Graphics pipeline plus the layouts it was built with
pub struct Pipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    uniforms: Vec<UniformBinding>,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    /// Build a pipeline for vertex type `V` against `render_pass`
    pub fn new<V: Vertex>(
        device: &Arc<VulkanDevice>,
        render_pass: &RenderPass,
        desc: &PipelineDesc,
    ) -> Result<Self> {
        let vert_shader = Shader::load(device, &desc.vertex_shader)?;
        let frag_shader = Shader::load(device, &desc.fragment_shader)?;

        // Descriptor set layout from the declared uniform bindings
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .uniforms
            .iter()
            .map(|uniform| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(uniform.binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(uniform.stages)
                    .build()
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let descriptor_set_layout =
            unsafe { device.device.create_descriptor_set_layout(&set_layout_info, None) }
                .context("Failed to create descriptor set layout")?;

        let set_layouts = [descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(e).context("Failed to create pipeline layout");
            }
        };

        let handle = match Self::create_graphics_pipeline::<V>(
            device,
            render_pass,
            layout,
            &vert_shader,
            &frag_shader,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                unsafe {
                    device.device.destroy_pipeline_layout(layout, None);
                    device.device.destroy_descriptor_set_layout(descriptor_set_layout, None);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Created pipeline ({} attributes, {} uniforms)",
            V::ATTRIBUTES.len(),
            desc.uniforms.len()
        );

        // Shader modules are only needed during pipeline creation
        Ok(Self {
            handle,
            layout,
            descriptor_set_layout,
            uniforms: desc.uniforms.clone(),
            device: device.clone(),
        })
    }

    fn create_graphics_pipeline<V: Vertex>(
        device: &VulkanDevice,
        render_pass: &RenderPass,
        layout: vk::PipelineLayout,
        vert_shader: &Shader,
        frag_shader: &Shader,
    ) -> Result<vk::Pipeline> {
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader.module())
            .name(c"main")
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader.module())
            .name(c"main")
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Vertex input
        let bindings = [vertex_binding_description::<V>()];
        let attributes = vertex_attribute_descriptions::<V>();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only the counts are fixed here
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Opaque, no blending
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };

        pipelines
            .into_iter()
            .next()
            .context("Driver returned no pipeline")
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    /// Uniform bindings, in declaration order
    pub fn uniforms(&self) -> &[UniformBinding] {
        &self.uniforms
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};
    use std::mem::offset_of;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Textured {
        pos: [f32; 3],
        uv: [f32; 2],
        tint: [f32; 4],
    }

    impl Vertex for Textured {
        const ATTRIBUTES: &'static [VertexAttribute] = &[
            VertexAttribute::vec3(offset_of!(Textured, pos)),
            VertexAttribute::vec2(offset_of!(Textured, uv)),
            VertexAttribute::vec4(offset_of!(Textured, tint)),
        ];
    }

    #[test]
    fn binding_stride_is_struct_size() {
        let binding = vertex_binding_description::<Textured>();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 36);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn attributes_keep_declaration_order() {
        let attributes = vertex_attribute_descriptions::<Textured>();
        let summary: Vec<_> = attributes
            .iter()
            .map(|a| (a.location, a.format, a.offset))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, vk::Format::R32G32B32_SFLOAT, 0),
                (1, vk::Format::R32G32_SFLOAT, 12),
                (2, vk::Format::R32G32B32A32_SFLOAT, 20),
            ]
        );
        assert!(attributes.iter().all(|a| a.binding == 0));
    }

    #[test]
    fn scalar_attribute() {
        assert_eq!(
            VertexAttribute::float(8),
            VertexAttribute {
                format: vk::Format::R32_SFLOAT,
                offset: 8
            }
        );
    }
}
