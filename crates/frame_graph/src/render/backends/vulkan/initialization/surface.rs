//! Window surface and its presentation capabilities

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::render::api::{check_result, VulkanResult};

use super::VulkanInstance;

/// Presentation surface; must be dropped before the instance
pub struct Surface {
    loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface for a native window
    pub fn new(instance: &VulkanInstance, display: RawDisplayHandle, window: RawWindowHandle) -> VulkanResult<Self> {
        let loader = khr::Surface::new(&instance.entry, &instance.instance);
        let surface = check_result(
            unsafe { ash_window::create_surface(&instance.entry, &instance.instance, display, window, None) },
            "create surface",
        )?;
        Ok(Self { loader, surface })
    }

    /// Surface handle
    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader
    pub const fn loader(&self) -> &khr::Surface {
        &self.loader
    }

    /// Surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        check_result(
            unsafe { self.loader.get_physical_device_surface_capabilities(physical_device, self.surface) },
            "query surface capabilities",
        )
    }

    /// Supported surface formats
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        check_result(
            unsafe { self.loader.get_physical_device_surface_formats(physical_device, self.surface) },
            "query surface formats",
        )
    }

    /// Supported present modes
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        check_result(
            unsafe { self.loader.get_physical_device_surface_present_modes(physical_device, self.surface) },
            "query present modes",
        )
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Prefer an sRGB BGRA format, otherwise the first one offered
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// FIFO with vsync; otherwise MAILBOX, then IMMEDIATE, falling back to FIFO
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Requested extent clamped to the surface limits; the surface's own extent wins when fixed
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: requested.height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// One image more than the minimum, within the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}
