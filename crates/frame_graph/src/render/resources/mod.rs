//! GPU resource wrappers
//!
//! RAII owners of buffers, images, samplers, framebuffers and descriptor
//! objects. Each wrapper keeps the device context alive and releases its
//! handles on drop.

mod buffer;
mod descriptor;
mod framebuffer;
mod image;
mod sampler;

pub use self::buffer::{align_up, Buffer, BufferDescription};
pub use self::descriptor::{DescriptorPoolManager, DescriptorSetLayoutBuilder, DescriptorWriter, SETS_PER_POOL};
pub use self::framebuffer::{
    Framebuffer, FramebufferAttachment, FramebufferDescription, FramebufferResizeCallback, SharedFramebuffer,
};
pub use self::image::{
    access_for_layout, aspect_for_format, is_depth_format, Image, ImageDescription, SharedExtent, SharedImage,
};
pub use self::sampler::{Sampler, SamplerDescription};
