//! Vulkan instance, physical device selection and logical device creation

use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::RawDisplayHandle;

use crate::render::api::{check_result, VulkanError, VulkanResult};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };
const ENGINE_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"frame_graph\0") };

/// Vulkan instance with the optional validation messenger
pub struct VulkanInstance {
    /// Loaded Vulkan library
    pub entry: Entry,
    /// Instance dispatch table
    pub instance: Instance,
    /// Debug utilities, present when validation is enabled
    pub debug_utils: Option<DebugUtils>,
    debug_messenger: vk::DebugUtilsMessengerEXT,
}

impl VulkanInstance {
    /// Create an instance with the extensions the display needs
    pub fn new(display: RawDisplayHandle, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("Application name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions: Vec<*const c_char> = check_result(
            ash_window::enumerate_required_extensions(display),
            "enumerate surface extensions",
        )?
        .to_vec();

        let validation = enable_validation && Self::validation_available(&entry);
        if enable_validation && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        let layers: Vec<*const c_char> = if validation { vec![VALIDATION_LAYER.as_ptr()] } else { Vec::new() };
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let enabled_features = [vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION];
        let mut validation_features =
            vk::ValidationFeaturesEXT::builder().enabled_validation_features(&enabled_features);
        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if validation {
            create_info = create_info.push_next(&mut validation_features);
        }

        let instance = check_result(unsafe { entry.create_instance(&create_info, None) }, "create instance")?;

        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        log::info!("Vulkan instance created (validation {})", if validation { "on" } else { "off" });
        Ok(Self { entry, instance, debug_utils, debug_messenger })
    }

    fn validation_available(entry: &Entry) -> bool {
        entry.enumerate_instance_layer_properties().is_ok_and(|layers| {
            layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER)
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        check_result(
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) },
            "create debug messenger",
        )
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// GPU chosen for rendering and its queue families
pub struct PhysicalDeviceInfo {
    /// Chosen GPU
    pub device: vk::PhysicalDevice,
    /// Properties, including `limits`
    pub properties: vk::PhysicalDeviceProperties,
    /// Optional features the GPU offers
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family used for graphics submits
    pub graphics_family: u32,
    /// Family able to present to the surface
    pub present_family: u32,
    /// Queue family used for compute passes; always the graphics family
    pub compute_family: u32,
    /// Queue index within `compute_family`: 1 when the family has a second queue
    pub compute_queue_index: u32,
}

impl PhysicalDeviceInfo {
    /// Pick the first device that can render and present, preferring discrete GPUs
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
    ) -> VulkanResult<Self> {
        let devices = check_result(unsafe { instance.enumerate_physical_devices() }, "enumerate physical devices")?;

        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::debug!("Skipping physical device: {e}");
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|info| info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);

        let selected = candidates
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InitializationFailed("No suitable GPU found".to_string()))?;
        log::info!("Selected GPU: {}", selected.name());
        Ok(selected)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;
        for (index, family) in (0u32..).zip(queue_families.iter()) {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
            if graphics && graphics_family.is_none() {
                graphics_family = Some(index);
            }
            let present_support = unsafe { surface_loader.get_physical_device_surface_support(device, index, surface) }?;
            if present_support && (present_family.is_none() || graphics_family == Some(index)) {
                present_family = Some(index);
            }
        }

        let graphics_family = graphics_family
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics queue family found".to_string()))?;
        // compute shares the graphics family so exclusive images need no ownership transfers
        let compute_queue_index = u32::from(queue_families.get(graphics_family as usize).is_some_and(|f| f.queue_count > 1));
        let present_family = present_family
            .ok_or_else(|| VulkanError::InitializationFailed("No present queue family found".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let has_swapchain = extensions
            .iter()
            .any(|available| unsafe { CStr::from_ptr(available.extension_name.as_ptr()) } == SwapchainLoader::name());
        if !has_swapchain {
            return Err(VulkanError::InitializationFailed("Required device extensions not supported".to_string()));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            graphics_family,
            present_family,
            compute_family: graphics_family,
            compute_queue_index,
        })
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }.to_string_lossy().into_owned()
    }
}

/// Logical device and its queues
pub struct LogicalDevice {
    /// Device dispatch table
    pub device: Device,
    /// Queue for graphics submits
    pub graphics_queue: vk::Queue,
    /// Queue for presents
    pub present_queue: vk::Queue,
    /// Queue for compute passes; the graphics queue when its family has only one
    pub compute_queue: vk::Queue,
    /// `VK_KHR_swapchain` function table
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create a logical device with one queue per distinct family
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let unique_families: HashSet<u32> =
            [physical.graphics_family, physical.present_family, physical.compute_family].into_iter().collect();

        let priorities = [1.0_f32, 1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                let count = if family == physical.compute_family { physical.compute_queue_index as usize + 1 } else { 1 };
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count])
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];
        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = check_result(
            unsafe { instance.create_device(physical.device, &create_info, None) },
            "create logical device",
        )?;

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let compute_queue = unsafe { device.get_device_queue(physical.compute_family, physical.compute_queue_index) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self { device, graphics_queue, present_queue, compute_queue, swapchain_loader })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Device wait failed during shutdown: {e:?}");
            }
            self.device.destroy_device(None);
        }
    }
}
