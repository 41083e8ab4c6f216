//! Vulkan backend implementation
//!
//! Instance and device initialization plus the [`GpuDevice`](crate::render::api::GpuDevice)
//! implementation used on real hardware.

/// Vulkan initialization types (instance, devices, surface)
pub mod initialization;

mod device;

pub use device::VulkanDevice;
pub use initialization::{LogicalDevice, PhysicalDeviceInfo, Surface, VulkanInstance};
