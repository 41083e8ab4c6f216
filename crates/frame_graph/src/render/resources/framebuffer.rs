//! Framebuffers over owned attachment images or caller-supplied views

use std::sync::{Arc, PoisonError, RwLock};

use ash::vk::{self, Handle};

use crate::render::api::{RenderContext, VulkanError, VulkanResult};
use crate::render::pools::FramebufferPoolKey;

use super::{Image, ImageDescription, SharedExtent};

/// Framebuffer shared with the resize pool
pub type SharedFramebuffer = Arc<RwLock<Framebuffer>>;

/// Invoked after a framebuffer has been recreated
pub type FramebufferResizeCallback = Box<dyn FnMut(&Framebuffer) + Send + Sync>;

/// One framebuffer attachment
#[derive(Debug, Clone, PartialEq)]
pub enum FramebufferAttachment {
    /// Image created and owned by the framebuffer, sized to it
    Owned(ImageDescription),
    /// Existing view, such as a swapchain image
    View(vk::ImageView),
}

/// Framebuffer creation parameters
#[derive(Debug, Clone)]
pub struct FramebufferDescription {
    /// Debug name; also the key for pool removal by name
    pub debug_name: String,
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layer count
    pub layers: u32,
    /// Attachments in render pass order
    pub attachments: Vec<FramebufferAttachment>,
    /// Register in the framebuffer pool and recreate on resize
    pub resizable: bool,
    /// Explicit extent used on resize instead of the swapchain extent
    pub extent: Option<SharedExtent>,
}

impl Default for FramebufferDescription {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            render_pass: vk::RenderPass::null(),
            width: 1,
            height: 1,
            layers: 1,
            attachments: Vec::new(),
            resizable: false,
            extent: None,
        }
    }
}

/// Framebuffer with its owned attachments
pub struct Framebuffer {
    ctx: Arc<RenderContext>,
    desc: FramebufferDescription,
    framebuffer: vk::Framebuffer,
    images: Vec<Option<Image>>,
    on_resize: Option<FramebufferResizeCallback>,
    pub(crate) pool_key: Option<FramebufferPoolKey>,
}

impl Framebuffer {
    /// Create a framebuffer that is not tracked by the resize pool
    pub fn new(ctx: &Arc<RenderContext>, desc: FramebufferDescription) -> VulkanResult<Self> {
        let mut framebuffer = Self {
            ctx: Arc::clone(ctx),
            desc,
            framebuffer: vk::Framebuffer::null(),
            images: Vec::new(),
            on_resize: None,
            pool_key: None,
        };
        framebuffer.build()?;
        Ok(framebuffer)
    }

    /// Create a shared framebuffer, registering it in the pool when resizable
    pub fn create(ctx: &Arc<RenderContext>, desc: FramebufferDescription) -> VulkanResult<SharedFramebuffer> {
        let resizable = desc.resizable;
        let name = desc.debug_name.clone();
        let shared = Arc::new(RwLock::new(Self::new(ctx, desc)?));
        if resizable {
            let key = ctx.framebuffer_pool().add_to_pool(name, &shared);
            shared.write().unwrap_or_else(PoisonError::into_inner).pool_key = Some(key);
        }
        Ok(shared)
    }

    fn build(&mut self) -> VulkanResult<()> {
        if self.desc.attachments.is_empty() {
            return Err(VulkanError::invalid(format!("Framebuffer '{}' has no attachments", self.desc.debug_name)));
        }

        let mut views = Vec::with_capacity(self.desc.attachments.len());
        self.images.clear();
        for attachment in &self.desc.attachments {
            match attachment {
                FramebufferAttachment::Owned(image_desc) => {
                    let image_desc = ImageDescription {
                        width: self.desc.width,
                        height: self.desc.height,
                        create_view: true,
                        resizable: false,
                        ..image_desc.clone()
                    };
                    let image = Image::new(&self.ctx, image_desc)?;
                    views.push(image.view());
                    self.images.push(Some(image));
                }
                FramebufferAttachment::View(view) => {
                    views.push(*view);
                    self.images.push(None);
                }
            }
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.desc.render_pass)
            .attachments(&views)
            .width(self.desc.width.max(1))
            .height(self.desc.height.max(1))
            .layers(self.desc.layers.max(1));
        self.framebuffer = self.ctx.device().create_framebuffer(&info)?;
        if !self.desc.debug_name.is_empty() {
            self.ctx
                .device()
                .set_object_name(vk::ObjectType::FRAMEBUFFER, self.framebuffer.as_raw(), &self.desc.debug_name);
        }
        log::debug!("Created framebuffer '{}' {}x{}", self.desc.debug_name, self.desc.width, self.desc.height);
        Ok(())
    }

    fn release_gpu(&mut self) {
        if self.framebuffer != vk::Framebuffer::null() {
            self.ctx.device().destroy_framebuffer(self.framebuffer);
            self.framebuffer = vk::Framebuffer::null();
        }
        self.images.clear();
    }

    /// Recreate owned attachments and the framebuffer
    ///
    /// A bound explicit extent wins over `extent`. The resize callback runs
    /// after the new framebuffer exists.
    pub fn resize(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        let target = self
            .desc
            .extent
            .as_ref()
            .map_or(extent, |bound| *bound.read().unwrap_or_else(PoisonError::into_inner));

        self.release_gpu();
        self.desc.width = target.width.max(1);
        self.desc.height = target.height.max(1);
        self.build()?;

        if let Some(mut callback) = self.on_resize.take() {
            callback(self);
            self.on_resize = Some(callback);
        }
        Ok(())
    }

    /// Replace a caller-supplied view, effective at the next resize
    pub fn set_view_attachment(&mut self, index: usize, view: vk::ImageView) -> VulkanResult<()> {
        match self.desc.attachments.get_mut(index) {
            Some(FramebufferAttachment::View(existing)) => {
                *existing = view;
                Ok(())
            }
            _ => Err(VulkanError::invalid(format!("Attachment {index} is not a view attachment"))),
        }
    }

    /// Set the callback run after every resize
    pub fn set_on_resize(&mut self, callback: FramebufferResizeCallback) {
        self.on_resize = Some(callback);
    }

    /// Framebuffer handle
    pub const fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Render pass the framebuffer is compatible with
    pub const fn render_pass(&self) -> vk::RenderPass {
        self.desc.render_pass
    }

    /// Current extent
    pub const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.desc.width, height: self.desc.height }
    }

    /// Owned image for attachment `index`
    pub fn image(&self, index: usize) -> Option<&Image> {
        self.images.get(index).and_then(Option::as_ref)
    }

    /// Creation parameters with the current extent
    pub const fn description(&self) -> &FramebufferDescription {
        &self.desc
    }

    /// Whether the framebuffer is registered in the resize pool
    pub const fn is_pooled(&self) -> bool {
        self.pool_key.is_some()
    }

    /// Release GPU objects and leave the framebuffer pool
    pub fn destroy(&mut self) {
        if let Some(key) = self.pool_key.take() {
            self.ctx.framebuffer_pool().remove_key(key);
        }
        self.release_gpu();
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("name", &self.desc.debug_name)
            .field("framebuffer", &self.framebuffer)
            .field("extent", &(self.desc.width, self.desc.height))
            .finish_non_exhaustive()
    }
}
