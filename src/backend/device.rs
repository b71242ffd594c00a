// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers (debug builds only)
// - Physical device selection (first device with a graphics queue family)
// - Logical device + graphics queue creation
// - Surface ownership once a window connects
//
// Everything else holds an Arc<VulkanDevice>, so the device outlives every
// resource created from it.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYERS: [&CStr; 1] = [c"VK_LAYER_KHRONOS_validation"];

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    pub surface_loader: khr::Surface,
    surface: Option<vk::SurfaceKHR>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the instance, pick a GPU and create the logical device.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `required_extensions` - Instance extensions, e.g. from the window
    /// * `enable_validation` - Enable Vulkan validation layers
    ///
    /// `VK_KHR_swapchain` is enabled on the device only when
    /// `required_extensions` contains `VK_KHR_surface`.
    pub fn new(app_name: &str, required_extensions: &[&CStr], enable_validation: bool) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        if enable_validation {
            ensure_validation_layers_supported(&entry)?;
        }
        let instance = Self::create_instance(&entry, app_name, required_extensions, enable_validation)?;

        // Steps 3-5 own nothing yet, so the instance is the only thing to undo
        let wants_swapchain = required_extensions.contains(&khr::Surface::name());
        let parts = match Self::init_on_instance(&entry, &instance, enable_validation, wants_swapchain) {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let DeviceParts {
            debug_utils,
            physical_device,
            graphics_queue_family,
            device,
            graphics_queue,
        } = parts;

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let surface_loader = khr::Surface::new(&entry, &instance);

        Ok(Self {
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            surface_loader,
            surface: None,
            debug_utils,
            properties,
            memory_properties,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        required_extensions: &[&CStr],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"villa";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> =
            required_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names: Vec<*const c_char> = if enable_validation {
            VALIDATION_LAYERS.iter().map(|layer| layer.as_ptr()).collect()
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn init_on_instance(
        entry: &Entry,
        instance: &ash::Instance,
        enable_validation: bool,
        wants_swapchain: bool,
    ) -> Result<DeviceParts> {
        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(entry, instance)?)
        } else {
            None
        };

        // Step 4 + 5: pick a GPU, create the logical device
        let device = Self::pick_physical_device(instance).and_then(|(physical_device, family)| {
            let (device, queue) =
                Self::create_logical_device(instance, physical_device, family, wants_swapchain)?;
            Ok((physical_device, family, device, queue))
        });

        match device {
            Ok((physical_device, graphics_queue_family, device, graphics_queue)) => Ok(DeviceParts {
                debug_utils,
                physical_device,
                graphics_queue_family,
                device,
                graphics_queue,
            }),
            Err(e) => {
                if let Some((utils, messenger)) = debug_utils {
                    unsafe { utils.destroy_debug_utils_messenger(messenger, None) };
                }
                Err(e)
            }
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// First device exposing a graphics-capable queue family wins
    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        devices
            .into_iter()
            .find_map(|device| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                find_graphics_queue_family(&families).map(|family| (device, family))
            })
            .context("No GPU exposes a graphics-capable queue family")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        wants_swapchain: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let mut extensions = Vec::new();
        if wants_swapchain {
            extensions.push(khr::Swapchain::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Take ownership of a window surface and verify the graphics queue can
    /// present to it. The surface is destroyed with the device either way.
    pub fn connect_to_surface(&mut self, surface: vk::SurfaceKHR) -> Result<()> {
        if let Some(old) = self.surface.replace(surface) {
            unsafe { self.surface_loader.destroy_surface(old, None) };
        }

        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.graphics_queue_family,
                surface,
            )
        }
        .context("Failed to query surface support")?;

        if !supported {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        log::debug!("Connected surface {:?}", surface);
        Ok(())
    }

    /// Surface connected with [`VulkanDevice::connect_to_surface`]
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }

    /// Block until the graphics queue has drained
    pub fn wait_queue_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.graphics_queue) }
            .context("vkQueueWaitIdle failed")?;
        Ok(())
    }
}

struct DeviceParts {
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    device: ash::Device,
    graphics_queue: vk::Queue,
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Reverse order of creation
        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                self.surface_loader.destroy_surface(surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Index of the first queue family with graphics capability
pub fn find_graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|index| index as u32)
}

/// Names from `wanted` that are not in `available`
fn missing_layers<'a>(wanted: &[&'a CStr], available: &[vk::LayerProperties]) -> Vec<&'a CStr> {
    wanted
        .iter()
        .copied()
        .filter(|layer| {
            !available
                .iter()
                .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == *layer)
        })
        .collect()
}

fn ensure_validation_layers_supported(entry: &Entry) -> Result<()> {
    let available = entry
        .enumerate_instance_layer_properties()
        .context("Failed to enumerate instance layers")?;

    let missing = missing_layers(&VALIDATION_LAYERS, &available);
    if let Some(layer) = missing.first() {
        anyhow::bail!("Validation layer {} not supported", layer.to_string_lossy());
    }
    Ok(())
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    let level = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        _ => log::Level::Debug,
    };
    log::log!(level, "[Vulkan] {}", message);
    crate::logging::record_validation_message(level, &message);

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as c_char;
        }
        props
    }

    #[test]
    fn graphics_family_found_among_other_flags() {
        // Matched by flag containment, whatever else the family supports
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(find_graphics_queue_family(&families), Some(2));
    }

    #[test]
    fn first_graphics_family_wins() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(find_graphics_queue_family(&families), Some(0));
    }

    #[test]
    fn no_graphics_family() {
        let families = [family(vk::QueueFlags::COMPUTE), family(vk::QueueFlags::TRANSFER)];
        assert_eq!(find_graphics_queue_family(&families), None);
        assert_eq!(find_graphics_queue_family(&[]), None);
    }

    #[test]
    fn empty_family_is_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(find_graphics_queue_family(&families), Some(1));
    }

    #[test]
    fn detects_missing_validation_layer() {
        let available = [layer(c"VK_LAYER_LUNARG_api_dump")];
        assert_eq!(missing_layers(&VALIDATION_LAYERS, &available), VALIDATION_LAYERS.to_vec());

        let available = [layer(c"VK_LAYER_LUNARG_api_dump"), layer(c"VK_LAYER_KHRONOS_validation")];
        assert!(missing_layers(&VALIDATION_LAYERS, &available).is_empty());
    }
}
