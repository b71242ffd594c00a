// Swapchain - Window presentation
//
// Owns the presentable images plus one view and one framebuffer per image.
// Image count, format and extent are fixed for the swapchain's lifetime; a
// resize builds a whole new Swapchain and drops the old one, which
// invalidates every handle it handed out.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::frame::Frame;
use super::pipeline::RenderPass;
use super::VulkanDevice;

// =============================================================================
// CREATION INFO
// =============================================================================

/// Surface capabilities of the physical device, queried at creation and on
/// every rebuild
#[derive(Debug, Clone)]
pub struct SwapchainCreationInfo {
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl SwapchainCreationInfo {
    /// None when the device cannot present at all (no format or no mode)
    pub fn new(
        surface_formats: Vec<vk::SurfaceFormatKHR>,
        present_modes: Vec<vk::PresentModeKHR>,
        capabilities: vk::SurfaceCapabilitiesKHR,
    ) -> Option<Self> {
        if surface_formats.is_empty() || present_modes.is_empty() {
            return None;
        }
        Some(Self {
            surface_formats,
            present_modes,
            capabilities,
        })
    }

    /// Query the device's connected surface
    pub fn query(device: &VulkanDevice) -> Result<Option<Self>> {
        let surface = device
            .surface()
            .context("No surface connected to the device")?;
        let loader = &device.surface_loader;
        let physical_device = device.physical_device;

        let capabilities = unsafe {
            loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;

        let surface_formats =
            unsafe { loader.get_physical_device_surface_formats(physical_device, surface) }
                .context("Failed to query surface formats")?;

        let present_modes =
            unsafe { loader.get_physical_device_surface_present_modes(physical_device, surface) }
                .context("Failed to query present modes")?;

        Ok(Self::new(surface_formats, present_modes, capabilities))
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        choose_surface_format(&self.surface_formats)
    }
}

/// Prefer BGRA8 sRGB, then any sRGB format, then whatever comes first.
///
/// `formats` must not be empty.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.iter().find(|f| is_srgb(f.format)))
        .unwrap_or(&formats[0])
        .to_owned()
}

fn is_srgb(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_SRGB
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::A8B8G8R8_SRGB_PACK32
            | vk::Format::B8G8R8_SRGB
            | vk::Format::R8G8B8_SRGB
    )
}

/// Present mode policy:
/// - the configured preference when available
/// - MAILBOX: no vsync, no tearing
/// - FIFO: vsync, guaranteed available
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [preferred, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the window size clamped to the
/// supported range when the surface leaves it to us
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

// =============================================================================
// SWAPCHAIN
// =============================================================================

/// Result of asking for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Usable, but the swapchain no longer matches the surface
    Suboptimal(u32),
    OutOfDate,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Shown, but the swapchain should be rebuilt
    Suboptimal,
    /// Not shown; the swapchain must be rebuilt
    OutOfDate,
}

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: khr::Swapchain,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::Format,
    extent: vk::Extent2D,
    generation: u64,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build a swapchain for the device's surface with one framebuffer per
    /// image bound to `render_pass`.
    ///
    /// `generation` tags every frame acquired from this swapchain.
    pub fn new(
        device: Arc<VulkanDevice>,
        info: &SwapchainCreationInfo,
        render_pass: &RenderPass,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
        generation: u64,
    ) -> Result<Self> {
        let surface = device
            .surface()
            .context("No surface connected to the device")?;

        let caps = &info.capabilities;
        let surface_format = info.surface_format();
        let present_mode = choose_present_mode(&info.present_modes, preferred_present_mode);
        let extent = choose_extent(caps, width, height);
        let image_count = choose_image_count(caps);

        if extent.width == 0 || extent.height == 0 {
            anyhow::bail!("Cannot create a swapchain for a zero-area surface");
        }
        if surface_format.format != render_pass.format() {
            anyhow::bail!(
                "Surface format {:?} does not match render pass format {:?}",
                surface_format.format,
                render_pass.format()
            );
        }

        log::info!(
            "Creating swapchain #{}: {}x{}, {} images, {:?}, {:?}",
            generation,
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on, partially built state is torn down by Drop
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format: surface_format.format,
            extent,
            generation,
            device,
        };

        this.images = unsafe { this.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &this.images {
            let view = this.create_image_view(image)?;
            this.image_views.push(view);
        }

        for &view in &this.image_views {
            let framebuffer = this.create_framebuffer(view, render_pass)?;
            this.framebuffers.push(framebuffer);
        }

        log::debug!("Swapchain #{} has {} images", generation, this.images.len());

        Ok(this)
    }

    fn create_image_view(&self, image: vk::Image) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    fn create_framebuffer(
        &self,
        view: vk::ImageView,
        render_pass: &RenderPass,
    ) -> Result<vk::Framebuffer> {
        let attachments = [view];
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(&attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);

        unsafe { self.device.device.create_framebuffer(&create_info, None) }
            .context("Failed to create framebuffer")
    }

    /// Ask for the next image; `fence` is signaled once it can be written
    pub fn acquire_next_image(&self, fence: vk::Fence) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                fence,
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Ready(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    /// Framebuffer for an image acquired from this swapchain
    pub fn framebuffer(&self, frame: &Frame) -> vk::Framebuffer {
        assert_eq!(
            frame.generation, self.generation,
            "frame acquired from swapchain #{} used with swapchain #{}",
            frame.generation, self.generation
        );
        self.framebuffers[frame.image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn creation_info_requires_formats_and_modes() {
        let c = caps((800, 600), 2, 3);
        let formats = vec![format(vk::Format::B8G8R8A8_SRGB)];
        let modes = vec![vk::PresentModeKHR::FIFO];

        assert!(SwapchainCreationInfo::new(Vec::new(), modes.clone(), c).is_none());
        assert!(SwapchainCreationInfo::new(formats.clone(), Vec::new(), c).is_none());
        assert!(SwapchainCreationInfo::new(Vec::new(), Vec::new(), c).is_none());

        let info = SwapchainCreationInfo::new(formats, modes, c).unwrap();
        assert_eq!(info.surface_formats.len(), 1);
        assert_eq!(info.present_modes, vec![vk::PresentModeKHR::FIFO]);
    }

    #[test]
    fn prefers_bgra_srgb() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_SRGB),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_any_srgb_then_first() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_SRGB);

        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
    }

    #[test]
    fn present_mode_policy() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&all, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );

        let no_immediate = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&no_immediate, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::MAILBOX
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_unless_undefined() {
        let fixed = caps((800, 600), 2, 3);
        assert_eq!(
            choose_extent(&fixed, 1920, 1080),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );

        let free = caps((u32::MAX, u32::MAX), 2, 3);
        assert_eq!(
            choose_extent(&free, 1920, 1080),
            vk::Extent2D {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(
            choose_extent(&free, 10_000, 0),
            vk::Extent2D {
                width: 4096,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 8)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 3, 3)), 3);
        // No upper bound
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
    }
}
