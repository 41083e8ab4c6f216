use std::sync::{Mutex, PoisonError, RwLock, Weak};

use ash::vk;
use slotmap::SlotMap;

use crate::render::api::VulkanResult;
use crate::render::resources::{Framebuffer, SharedFramebuffer};

use super::{FramebufferPoolKey, PoolError};

struct Entry {
    name: String,
    framebuffer: Weak<RwLock<Framebuffer>>,
}

/// Framebuffers recreated together on surface resize
#[derive(Default)]
pub struct FrameBufferPool {
    entries: Mutex<SlotMap<FramebufferPoolKey, Entry>>,
}

impl FrameBufferPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a framebuffer under `name`
    pub fn add_to_pool(&self, name: impl Into<String>, framebuffer: &SharedFramebuffer) -> FramebufferPoolKey {
        let name = name.into();
        log::debug!("Framebuffer '{name}' added to resize pool");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Entry { name, framebuffer: std::sync::Arc::downgrade(framebuffer) })
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
                log::error!("Framebuffer '{name}' is not in the resize pool");
                Err(PoolError::NotFound(name.to_string()))
            }
        }
    }

    /// Remove an entry by key; returns whether it was present
    pub fn remove_key(&self, key: FramebufferPoolKey) -> bool {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    /// Recreate every live framebuffer at `extent`, returning how many were resized
    ///
    /// Entries with a bound extent keep it. Dead entries are pruned. Every
    /// entry is visited even when one fails; the first error is returned.
    pub fn resize_buffers(&self, extent: vk::Extent2D) -> VulkanResult<usize> {
        let live: Vec<SharedFramebuffer> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, entry| entry.framebuffer.strong_count() > 0);
            entries.values().filter_map(|entry| entry.framebuffer.upgrade()).collect()
        };

        let mut first_error = None;
        let mut failed = 0;
        for framebuffer in &live {
            if let Err(e) = framebuffer.write().unwrap_or_else(PoisonError::into_inner).resize(extent) {
                log::error!("Failed to resize pooled framebuffer: {e}");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            log::error!("{failed} of {} pooled framebuffers failed to resize", live.len());
            return Err(e);
        }
        log::debug!("Resized {} pooled framebuffers to {}x{}", live.len(), extent.width, extent.height);
        Ok(live.len())
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of registered entries
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.name.clone())
            .collect()
    }
}
