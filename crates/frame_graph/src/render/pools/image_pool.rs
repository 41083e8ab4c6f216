use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use ash::vk;
use slotmap::SlotMap;

use crate::render::api::VulkanResult;
use crate::render::resources::{Image, SharedExtent, SharedImage};

use super::{ImagePoolKey, PoolError};

/// Invoked after a pooled image has been recreated
pub type ImageResizeCallback = Box<dyn FnMut(&Image) + Send>;

struct Entry {
    name: String,
    image: Weak<RwLock<Image>>,
    extent: Option<SharedExtent>,
    scale: f32,
    on_resize: Option<Arc<Mutex<ImageResizeCallback>>>,
}

struct Pending {
    image: SharedImage,
    extent: vk::Extent2D,
    on_resize: Option<Arc<Mutex<ImageResizeCallback>>>,
}

/// Images recreated together on surface resize
#[derive(Default)]
pub struct ImagePool {
    entries: Mutex<SlotMap<ImagePoolKey, Entry>>,
}

/// Scale an extent, keeping each side at least one texel
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub(crate) fn scale_extent(extent: vk::Extent2D, scale: f32) -> vk::Extent2D {
    let scale_side = |side: u32| ((side as f32 * scale).round() as u32).max(1);
    vk::Extent2D { width: scale_side(extent.width), height: scale_side(extent.height) }
}

impl ImagePool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image
    ///
    /// Without `extent` the image follows the extent passed to
    /// [`resize_images`](Self::resize_images). The description's
    /// `resize_scale` is applied on top of either.
    pub fn add_to_pool(
        &self,
        image: &SharedImage,
        extent: Option<SharedExtent>,
        on_resize: Option<ImageResizeCallback>,
    ) -> ImagePoolKey {
        let (name, scale) = {
            let guard = image.read().unwrap_or_else(PoisonError::into_inner);
            (guard.description().debug_name.clone(), guard.description().resize_scale)
        };
        log::debug!("Image '{name}' added to resize pool");
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(Entry {
            name,
            image: Arc::downgrade(image),
            extent,
            scale,
            on_resize: on_resize.map(|callback| Arc::new(Mutex::new(callback))),
        })
    }

    /// Remove the first entry registered under `name`
    pub fn remove_from_pool(&self, name: &str) -> Result<(), PoolError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = entries.iter().find(|(_, entry)| entry.name == name).map(|(key, _)| key);
        match key {
            Some(key) => {
                entries.remove(key);
                Ok(())
            }
            None => {
                log::error!("Image '{name}' is not in the resize pool");
                Err(PoolError::NotFound(name.to_string()))
            }
        }
    }

    /// Remove an entry by key; returns whether it was present
    pub fn remove_key(&self, key: ImagePoolKey) -> bool {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    /// Bind or clear the explicit extent of an entry
    pub fn bind_extent(&self, key: ImagePoolKey, extent: Option<SharedExtent>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get_mut(key).map(|entry| entry.extent = extent).is_some()
    }

    /// Replace the resize callback of an entry
    pub fn set_resize_callback(&self, key: ImagePoolKey, callback: ImageResizeCallback) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get_mut(key)
            .map(|entry| entry.on_resize = Some(Arc::new(Mutex::new(callback))))
            .is_some()
    }

    /// Recreate every live image, returning how many were resized
    ///
    /// Each image is rebuilt at its bound extent, or `extent` when unbound,
    /// scaled by its multiplier; its callback then runs. Dead entries are pruned.
    /// A failed entry does not stop the others; the first error is returned
    /// once every entry has been visited.
    pub fn resize_images(&self, extent: vk::Extent2D) -> VulkanResult<usize> {
        let pending: Vec<Pending> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, entry| entry.image.strong_count() > 0);
            entries
                .values()
                .filter_map(|entry| {
                    let image = entry.image.upgrade()?;
                    let base = entry
                        .extent
                        .as_ref()
                        .map_or(extent, |bound| *bound.read().unwrap_or_else(PoisonError::into_inner));
                    Some(Pending { image, extent: scale_extent(base, entry.scale), on_resize: entry.on_resize.clone() })
                })
                .collect()
        };

        let mut first_error = None;
        let mut failed = 0;
        for entry in &pending {
            let mut image = entry.image.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = image.recreate(entry.extent.width, entry.extent.height) {
                log::error!("Failed to resize pooled image '{}': {e}", image.description().debug_name);
                failed += 1;
                first_error.get_or_insert(e);
                continue;
            }
            if let Some(callback) = &entry.on_resize {
                (callback.lock().unwrap_or_else(PoisonError::into_inner))(&image);
            }
        }
        if let Some(e) = first_error {
            log::error!("{failed} of {} pooled images failed to resize", pending.len());
            return Err(e);
        }
        log::debug!("Resized {} pooled images (reference {}x{})", pending.len(), extent.width, extent.height);
        Ok(pending.len())
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::render::api::RenderContext;
    use crate::render::resources::ImageDescription;
    use crate::render::testing::MockDevice;

    fn pooled(name: &str, scale: f32) -> ImageDescription {
        ImageDescription {
            resizable: true,
            resize_scale: scale,
            ..ImageDescription::render_target(name, 100, 100, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT)
        }
    }

    #[test]
    fn test_scale_extent_keeps_one_texel() {
        let half = scale_extent(vk::Extent2D { width: 1920, height: 1081 }, 0.5);
        assert_eq!((half.width, half.height), (960, 541));
        let tiny = scale_extent(vk::Extent2D { width: 1, height: 1 }, 0.25);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn test_bound_extent_ignores_swapchain_size() {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        let bound: SharedExtent = Arc::new(RwLock::new(vk::Extent2D { width: 512, height: 512 }));

        let shadow = Image::create_resizable(&ctx, pooled("shadow", 1.0), Some(bound), None).expect("bound image");
        let color = Image::create(&ctx, pooled("color", 1.0)).expect("swapchain image");

        let resized = ctx.image_pool().resize_images(vk::Extent2D { width: 1920, height: 1080 }).expect("resize");
        assert_eq!(resized, 2);

        let shadow = shadow.read().expect("lock");
        let color = color.read().expect("lock");
        assert_eq!((shadow.extent().width, shadow.extent().height), (512, 512));
        assert_eq!((color.extent().width, color.extent().height), (1920, 1080));
        let created = mock.image(shadow.handle()).expect("created");
        assert_eq!((created.width, created.height), (512, 512));
    }

    #[test]
    fn test_scale_and_callback_applied() {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let half = Image::create_resizable(
            &ctx,
            pooled("half", 0.5),
            None,
            Some(Box::new(move |image: &Image| {
                assert_eq!(image.extent().width, 400);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .expect("image");

        ctx.image_pool().resize_images(vk::Extent2D { width: 800, height: 600 }).expect("resize");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(half.read().expect("lock").extent().height, 300);
    }

    #[test]
    fn test_remove_from_pool() {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        let image = Image::create(&ctx, pooled("ssr", 1.0)).expect("image");

        assert_eq!(ctx.image_pool().remove_from_pool("missing"), Err(PoolError::NotFound("missing".to_string())));
        ctx.image_pool().remove_from_pool("ssr").expect("remove");
        assert!(ctx.image_pool().is_empty());

        ctx.image_pool().resize_images(vk::Extent2D { width: 10, height: 10 }).expect("resize");
        assert_eq!(image.read().expect("lock").extent().width, 100);
    }

    #[test]
    fn test_failed_image_does_not_stop_the_others() {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        let calls = Arc::new(AtomicUsize::new(0));
        let images: Vec<SharedImage> = (0..3)
            .map(|i| {
                let seen = Arc::clone(&calls);
                Image::create_resizable(
                    &ctx,
                    pooled(&format!("target {i}"), 1.0),
                    None,
                    Some(Box::new(move |_: &Image| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .expect("image")
            })
            .collect();

        mock.fail_image_create_after(0);
        assert!(ctx.image_pool().resize_images(vk::Extent2D { width: 640, height: 480 }).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let live = images.iter().filter(|image| image.read().expect("lock").handle() != vk::Image::null()).count();
        assert_eq!(live, 2);

        ctx.image_pool().resize_images(vk::Extent2D { width: 640, height: 480 }).expect("retry");
        for image in &images {
            let image = image.read().expect("lock");
            assert_ne!(image.handle(), vk::Image::null());
            assert_eq!(image.extent().width, 640);
        }
    }

    #[test]
    fn test_dropped_image_leaves_pool() {
        let mock = MockDevice::new();
        let ctx = RenderContext::new(mock.clone()).expect("context");
        let image = Image::create(&ctx, pooled("temp", 1.0)).expect("image");
        assert_eq!(ctx.image_pool().len(), 1);
        drop(image);
        assert_eq!(ctx.image_pool().len(), 0);
        assert_eq!(mock.live_count(vk::ObjectType::IMAGE), 0);
    }
}
