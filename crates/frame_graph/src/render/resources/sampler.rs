//! Texture samplers

use std::sync::Arc;

use ash::vk;

use crate::render::api::{GpuDevice, VulkanResult};

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescription {
    /// Magnification and minification filter
    pub filter: vk::Filter,
    /// Filtering between mip levels
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Addressing on all three axes
    pub address_mode: vk::SamplerAddressMode,
    /// Requested anisotropy, clamped to the device limit; `None` disables it
    pub anisotropy: Option<f32>,
    /// Highest mip level that may be sampled
    pub max_lod: f32,
    /// Border color for clamp-to-border addressing
    pub border_color: vk::BorderColor,
    /// Depth comparison, for shadow maps
    pub compare_op: Option<vk::CompareOp>,
}

impl Default for SamplerDescription {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: Some(16.0),
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            compare_op: None,
        }
    }
}

impl SamplerDescription {
    /// Clamp-to-edge sampler, used for render targets read back by later passes
    pub fn clamp_to_edge() -> Self {
        Self { address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE, anisotropy: None, ..Self::default() }
    }
}

/// Sampler destroyed on drop
pub struct Sampler {
    device: Arc<dyn GpuDevice>,
    sampler: vk::Sampler,
    description: SamplerDescription,
}

impl Sampler {
    /// Create a sampler
    pub fn new(device: Arc<dyn GpuDevice>, description: SamplerDescription) -> VulkanResult<Self> {
        let max_anisotropy = device.limits().max_sampler_anisotropy;
        let anisotropy = description.anisotropy.map(|a| a.min(max_anisotropy));

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(description.filter)
            .min_filter(description.filter)
            .mipmap_mode(description.mipmap_mode)
            .address_mode_u(description.address_mode)
            .address_mode_v(description.address_mode)
            .address_mode_w(description.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(description.compare_op.is_some())
            .compare_op(description.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(description.max_lod)
            .border_color(description.border_color);

        let sampler = device.create_sampler(&info)?;
        Ok(Self { device, sampler, description })
    }

    /// Sampler handle
    pub const fn handle(&self) -> vk::Sampler {
        self.sampler
    }

    /// Parameters the sampler was created with
    pub const fn description(&self) -> &SamplerDescription {
        &self.description
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.sampler);
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").field("sampler", &self.sampler).finish_non_exhaustive()
    }
}
