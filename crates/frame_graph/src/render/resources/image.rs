//! # Images
//!
//! Sampled textures and render targets. An [`ImageDescription`] either names
//! pixel data (a file path or embedded RGBA8 bytes), which is decoded and
//! uploaded through a staging buffer, or describes a blank target that can be
//! transitioned to its final layout at creation. View, sampler and descriptor
//! set are each created only when the description asks for them.
//!
//! The current layout is tracked on the image. Transitions come in two forms:
//!
//! - [`Image::record_layout_transition`] records a barrier into a command
//!   buffer the caller submits;
//! - [`Image::transition_layout_blocking`] submits a one-shot command buffer
//!   and waits for it. This stalls the calling thread and is meant for
//!   creation-time work only.
//!
//! Resizable images are registered in the context's
//! [`ImagePool`](crate::render::pools::ImagePool) when built with
//! [`Image::create`] and recreated in place when the surface resizes.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use ash::vk::{self, Handle};

use crate::render::api::{MemoryAllocation, RenderContext, VulkanError, VulkanResult};
use crate::render::commands::CommandBuffer;
use crate::render::pools::{ImagePoolKey, ImageResizeCallback};

use super::{Buffer, DescriptorWriter, Sampler, SamplerDescription};

/// Image shared with the resize pool
pub type SharedImage = Arc<RwLock<Image>>;

/// Extent shared between a pooled resource and whoever drives its size
pub type SharedExtent = Arc<RwLock<vk::Extent2D>>;

/// 2x2 magenta/black checker used when a texture cannot be loaded
const PLACEHOLDER_PIXELS: [u8; 16] = [255, 0, 255, 255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 0, 255, 255];
const PLACEHOLDER_SIZE: u32 = 2;

/// Image creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescription {
    /// Debug name; also the key for pool removal by name
    pub debug_name: String,
    /// Width in texels; replaced by the decoded size for file-backed images
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels, 1 unless `image_type` is 3D
    pub depth: u32,
    /// Texel format
    pub format: vk::Format,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Required memory properties
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Mip level count
    pub mip_levels: u32,
    /// Array layer count; forced to 6 for cubemaps
    pub array_layers: u32,
    /// Image dimensionality
    pub image_type: vk::ImageType,
    /// Cube-compatible image with a cube view
    pub is_cubemap: bool,
    /// Texture file to decode
    pub path: Option<PathBuf>,
    /// Embedded RGBA8 pixels, one face per layer or a single face replicated to all layers
    pub data: Option<Vec<u8>>,
    /// Layout after upload or creation-time transition
    pub final_layout: vk::ImageLayout,
    /// Create an image view
    pub create_view: bool,
    /// Create a sampler
    pub create_sampler: bool,
    /// Allocate a descriptor set with the image bound at binding 0
    pub create_descriptor_set: bool,
    /// Transition a blank image to `final_layout` at creation
    pub transition_at_create: bool,
    /// Register in the image pool and recreate on resize
    pub resizable: bool,
    /// Multiplier applied to the reference extent on resize
    pub resize_scale: f32,
    /// Sampler parameters when `create_sampler` is set
    pub sampler: SamplerDescription,
}

impl Default for ImageDescription {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            width: 1,
            height: 1,
            depth: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mip_levels: 1,
            array_layers: 1,
            image_type: vk::ImageType::TYPE_2D,
            is_cubemap: false,
            path: None,
            data: None,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            create_view: true,
            create_sampler: false,
            create_descriptor_set: false,
            transition_at_create: false,
            resizable: false,
            resize_scale: 1.0,
            sampler: SamplerDescription::default(),
        }
    }
}

impl ImageDescription {
    /// Blank render target
    pub fn render_target(name: impl Into<String>, width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        let final_layout = if is_depth_format(format) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        Self { debug_name: name.into(), width, height, format, usage, final_layout, ..Self::default() }
    }

    /// Sampled texture decoded from a file
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            debug_name: path.display().to_string(),
            path: Some(path),
            create_sampler: true,
            create_descriptor_set: true,
            ..Self::default()
        }
    }

    /// Sampled texture from RGBA8 pixels
    pub fn from_pixels(name: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            debug_name: name.into(),
            width,
            height,
            data: Some(pixels),
            create_sampler: true,
            create_descriptor_set: true,
            ..Self::default()
        }
    }

    /// Layer count after applying the cubemap rule
    pub const fn layer_count(&self) -> u32 {
        if self.is_cubemap {
            6
        } else {
            self.array_layers
        }
    }

    /// Aspect implied by the format
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    /// Whether the image is filled from pixel data
    pub const fn has_pixels(&self) -> bool {
        self.path.is_some() || self.data.is_some()
    }
}

/// Whether `format` carries depth
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect flags for a format
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Access mask and pipeline stage that touch an image in `layout`
pub fn access_for_layout(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) -> (vk::ImageMemoryBarrier, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    let (src_access, src_stage) = access_for_layout(old_layout);
    let (dst_access, dst_stage) = access_for_layout(new_layout);
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .build();
    (barrier, src_stage, dst_stage)
}

struct Pixels {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

/// GPU image with optional view, sampler and descriptor set
pub struct Image {
    ctx: Arc<RenderContext>,
    desc: ImageDescription,
    image: vk::Image,
    memory: Option<MemoryAllocation>,
    view: vk::ImageView,
    sampler: Option<Sampler>,
    descriptor_set: vk::DescriptorSet,
    layout: vk::ImageLayout,
    pub(crate) pool_key: Option<ImagePoolKey>,
}

impl Image {
    /// Create an image that is not tracked by the resize pool
    pub fn new(ctx: &Arc<RenderContext>, desc: ImageDescription) -> VulkanResult<Self> {
        let mut image = Self {
            ctx: Arc::clone(ctx),
            desc,
            image: vk::Image::null(),
            memory: None,
            view: vk::ImageView::null(),
            sampler: None,
            descriptor_set: vk::DescriptorSet::null(),
            layout: vk::ImageLayout::UNDEFINED,
            pool_key: None,
        };
        image.allocate()?;
        log::debug!(
            "Created image '{}' {}x{} ({:?})",
            image.desc.debug_name,
            image.desc.width,
            image.desc.height,
            image.desc.format
        );
        Ok(image)
    }

    /// Create a shared image, registering it in the image pool when resizable
    ///
    /// Pooled images track the swapchain extent.
    pub fn create(ctx: &Arc<RenderContext>, desc: ImageDescription) -> VulkanResult<SharedImage> {
        Self::create_resizable(ctx, desc, None, None)
    }

    /// Create a shared image with an explicit extent binding and resize callback
    ///
    /// With `extent` set the image is recreated at that extent instead of the
    /// swapchain's. Both bindings are ignored for non-resizable descriptions.
    /// Images backed by pixel data cannot be resizable.
    pub fn create_resizable(
        ctx: &Arc<RenderContext>,
        desc: ImageDescription,
        extent: Option<SharedExtent>,
        on_resize: Option<ImageResizeCallback>,
    ) -> VulkanResult<SharedImage> {
        let resizable = desc.resizable;
        if resizable && desc.has_pixels() {
            log::error!("Image '{}' is backed by pixel data and cannot be resizable", desc.debug_name);
            return Err(VulkanError::invalid(format!(
                "Image '{}' is backed by pixel data and cannot be resizable",
                desc.debug_name
            )));
        }
        let shared = Arc::new(RwLock::new(Self::new(ctx, desc)?));
        if resizable {
            let key = ctx.image_pool().add_to_pool(&shared, extent, on_resize);
            shared.write().unwrap_or_else(std::sync::PoisonError::into_inner).pool_key = Some(key);
        }
        Ok(shared)
    }

    fn allocate(&mut self) -> VulkanResult<()> {
        let device = Arc::clone(self.ctx.device());
        let pixels = self.load_pixels();
        if let Some(pixels) = &pixels {
            self.desc.width = pixels.width;
            self.desc.height = pixels.height;
            self.desc.usage |= vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        }

        let layers = self.desc.layer_count();
        let flags = if self.desc.is_cubemap {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(self.desc.image_type)
            .format(self.desc.format)
            .extent(vk::Extent3D { width: self.desc.width.max(1), height: self.desc.height.max(1), depth: self.desc.depth.max(1) })
            .mip_levels(self.desc.mip_levels.max(1))
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        self.image = device.create_image(&info)?;
        self.layout = vk::ImageLayout::UNDEFINED;
        if !self.desc.debug_name.is_empty() {
            device.set_object_name(vk::ObjectType::IMAGE, self.image.as_raw(), &self.desc.debug_name);
        }

        let requirements = device.image_memory_requirements(self.image);
        let allocation = device.allocate_memory(&requirements, self.desc.memory_properties)?;
        self.memory = Some(allocation);
        device.bind_image_memory(self.image, allocation.memory, 0)?;

        if let Some(pixels) = pixels {
            self.upload(&pixels.bytes)?;
        } else if self.desc.transition_at_create {
            self.transition_layout_blocking(vk::ImageLayout::UNDEFINED, self.desc.final_layout, None)?;
        }

        if self.desc.create_view {
            let view_type = if self.desc.is_cubemap {
                vk::ImageViewType::CUBE
            } else if self.desc.image_type == vk::ImageType::TYPE_3D {
                vk::ImageViewType::TYPE_3D
            } else if layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            };
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(self.image)
                .view_type(view_type)
                .format(self.desc.format)
                .subresource_range(self.subresource_range());
            self.view = device.create_image_view(&view_info)?;
        }

        if self.desc.create_sampler && self.sampler.is_none() {
            self.sampler = Some(Sampler::new(Arc::clone(&device), self.desc.sampler)?);
        }

        if self.desc.create_descriptor_set {
            if self.descriptor_set == vk::DescriptorSet::null() {
                let layout = self.ctx.descriptor_pools().single_image_layout();
                self.descriptor_set = self.ctx.descriptor_pools().allocate(layout)?;
            }
            DescriptorWriter::new(self.descriptor_set)
                .image(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.descriptor_info())
                .write(device.as_ref());
        }
        Ok(())
    }

    fn load_pixels(&self) -> Option<Pixels> {
        let layers = self.desc.layer_count() as usize;
        let face = if let Some(data) = &self.desc.data {
            let face_len = self.desc.width as usize * self.desc.height as usize * 4;
            if data.len() == face_len * layers {
                return Some(Pixels { width: self.desc.width, height: self.desc.height, bytes: data.clone() });
            }
            if data.len() == face_len {
                Pixels { width: self.desc.width, height: self.desc.height, bytes: data.clone() }
            } else {
                log::error!(
                    "Image '{}': {} bytes of pixel data do not match {}x{} RGBA8, using placeholder",
                    self.desc.debug_name,
                    data.len(),
                    self.desc.width,
                    self.desc.height
                );
                placeholder()
            }
        } else if let Some(path) = &self.desc.path {
            match ::image::open(path) {
                Ok(decoded) => {
                    let rgba = decoded.to_rgba8();
                    let (width, height) = rgba.dimensions();
                    Pixels { width, height, bytes: rgba.into_raw() }
                }
                Err(err) => {
                    log::error!("Failed to load texture {}: {err}, using placeholder", path.display());
                    placeholder()
                }
            }
        } else {
            return None;
        };

        Some(Pixels { width: face.width, height: face.height, bytes: face.bytes.repeat(layers) })
    }

    fn upload(&mut self, bytes: &[u8]) -> VulkanResult<()> {
        let staging = Buffer::new(
            &self.ctx,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            bytes.len() as vk::DeviceSize,
            Some(bytes),
        )?;

        let range = self.subresource_range();
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: range.aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: range.layer_count,
            })
            .image_extent(vk::Extent3D { width: self.desc.width, height: self.desc.height, depth: 1 })
            .build();

        let final_layout = self.desc.final_layout;
        let ctx = Arc::clone(&self.ctx);
        CommandBuffer::one_shot(&ctx, |cmd| {
            self.record_layout_transition(cmd, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL, None);
            cmd.copy_buffer_to_image(staging.handle(), self.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
            self.record_layout_transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL, final_layout, None);
            Ok(())
        })
    }

    /// Record a layout transition into `cmd`
    ///
    /// `range` defaults to every mip level and layer. The tracked layout is
    /// updated immediately; the caller owns submission ordering.
    pub fn record_layout_transition(
        &mut self,
        cmd: &CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: Option<vk::ImageSubresourceRange>,
    ) {
        let range = range.unwrap_or_else(|| self.subresource_range());
        let (barrier, src_stage, dst_stage) = layout_barrier(self.image, old_layout, new_layout, range);
        cmd.pipeline_barrier(src_stage, dst_stage, &[barrier]);
        self.layout = new_layout;
    }

    /// Transition layouts with a one-shot submission, blocking until it completes
    pub fn transition_layout_blocking(
        &mut self,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: Option<vk::ImageSubresourceRange>,
    ) -> VulkanResult<()> {
        let ctx = Arc::clone(&self.ctx);
        CommandBuffer::one_shot(&ctx, |cmd| {
            self.record_layout_transition(cmd, old_layout, new_layout, range);
            Ok(())
        })
    }

    /// Recreate at a new extent, keeping sampler and descriptor set
    pub fn recreate(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        if self.desc.has_pixels() {
            return Err(VulkanError::invalid(format!(
                "Image '{}' is backed by pixel data and cannot be resized",
                self.desc.debug_name
            )));
        }
        self.release_gpu();
        self.desc.width = width.max(1);
        self.desc.height = height.max(1);
        self.allocate()
    }

    fn release_gpu(&mut self) {
        let device = self.ctx.device();
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if let Some(memory) = self.memory.take() {
            device.destroy_image(self.image);
            device.free_memory(memory.memory);
        } else if self.image != vk::Image::null() {
            device.destroy_image(self.image);
        }
        self.image = vk::Image::null();
        self.layout = vk::ImageLayout::UNDEFINED;
    }

    /// Release all GPU objects, the descriptor set included, and leave the image pool
    pub fn destroy(&mut self) {
        if let Some(key) = self.pool_key.take() {
            self.ctx.image_pool().remove_key(key);
        }
        if self.descriptor_set != vk::DescriptorSet::null() {
            if let Err(e) = self.ctx.descriptor_pools().free(self.descriptor_set) {
                log::error!("Failed to free descriptor set of image '{}': {e}", self.desc.debug_name);
            }
            self.descriptor_set = vk::DescriptorSet::null();
        }
        self.release_gpu();
        self.sampler = None;
    }

    /// Full subresource range of the image
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.desc.aspect(),
            base_mip_level: 0,
            level_count: self.desc.mip_levels.max(1),
            base_array_layer: 0,
            layer_count: self.desc.layer_count(),
        }
    }

    /// Descriptor info for sampling in shader-read layout
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        let image_layout = if self.desc.final_layout == vk::ImageLayout::GENERAL {
            vk::ImageLayout::GENERAL
        } else if is_depth_format(self.desc.format) {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        vk::DescriptorImageInfo {
            sampler: self.sampler.as_ref().map_or_else(vk::Sampler::null, Sampler::handle),
            image_view: self.view,
            image_layout,
        }
    }

    /// Image handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// View handle, null when no view was requested
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler, when requested
    pub const fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    /// Descriptor set, null when none was requested
    pub const fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Last layout set through this wrapper
    pub const fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Current 2D extent
    pub const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.desc.width, height: self.desc.height }
    }

    /// Texel format
    pub const fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Creation parameters, with the decoded size for file-backed images
    pub const fn description(&self) -> &ImageDescription {
        &self.desc
    }

    /// Whether the image is registered in the resize pool
    pub const fn is_pooled(&self) -> bool {
        self.pool_key.is_some()
    }
}

fn placeholder() -> Pixels {
    Pixels { width: PLACEHOLDER_SIZE, height: PLACEHOLDER_SIZE, bytes: PLACEHOLDER_PIXELS.to_vec() }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.desc.debug_name)
            .field("image", &self.image)
            .field("extent", &(self.desc.width, self.desc.height))
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
