//! SPIR-V shader modules

use std::ffi::CStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use ash::vk;

use crate::render::api::{GpuDevice, VulkanError, VulkanResult};

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Arc<dyn GpuDevice>,
    module: vk::ShaderModule,
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
}

/// Last modification time of a file, if it can be read
pub(crate) fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl ShaderModule {
    /// Create a shader module from SPIR-V words
    pub fn from_words(device: Arc<dyn GpuDevice>, words: &[u32]) -> VulkanResult<Self> {
        let module = device.create_shader_module(words)?;
        Ok(Self { device, module, path: None, modified: None })
    }

    /// Load a shader from a SPIR-V file
    pub fn from_file(device: Arc<dyn GpuDevice>, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let load_error = |reason: String| VulkanError::ResourceLoad { path: path.display().to_string(), reason };

        let modified = modified_time(path);
        let mut file = File::open(path).map_err(|e| load_error(e.to_string()))?;
        let words = ash::util::read_spv(&mut file).map_err(|e| load_error(e.to_string()))?;

        let mut shader = Self::from_words(device, &words).map_err(|e| {
            log::error!("Shader '{}' rejected by the device: {e}", path.display());
            e
        })?;
        shader.path = Some(path.to_path_buf());
        shader.modified = modified;
        log::debug!("Loaded shader '{}' ({} words)", path.display(), words.len());
        Ok(shader)
    }

    /// Shader module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Source file, when loaded from disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Modification time of the source file at load
    pub const fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Whether the source file changed since load
    pub fn is_stale(&self) -> bool {
        self.path.as_deref().is_some_and(|path| modified_time(path) != self.modified)
    }

    /// Stage create info referencing this module
    pub fn stage_info(&self, stage: vk::ShaderStageFlags, entry_point: &CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
    }
}
