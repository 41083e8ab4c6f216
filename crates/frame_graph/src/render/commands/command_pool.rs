//! Per-thread command pools
//!
//! Vulkan command pools are externally synchronized, so every thread that
//! records gets its own pool for each queue family it records for. A buffer
//! may only be submitted to a queue of the family its pool was created for,
//! which is why the family is part of the key.
//!
//! Buffers returned through [`CommandPoolManager::release`] are kept on a free
//! list and reused; pools are created with `RESET_COMMAND_BUFFER` so `begin`
//! resets them implicitly. A thread that stops recording calls
//! [`CommandPoolManager::release_thread_pool`]; pools still lending buffers are
//! destroyed when the last one comes back.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use ash::vk;

use crate::render::api::{GpuDevice, VulkanError, VulkanResult};

struct ThreadPool {
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    allocated: usize,
}

/// Command pools keyed by recording thread and queue family
pub struct CommandPoolManager {
    device: Arc<dyn GpuDevice>,
    pools: Mutex<HashMap<(ThreadId, u32), ThreadPool>>,
    orphaned: Mutex<Vec<ThreadPool>>,
}

impl CommandPoolManager {
    /// Create an empty manager; pools are created lazily per thread and family
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device, pools: Mutex::new(HashMap::new()), orphaned: Mutex::new(Vec::new()) }
    }

    /// Allocate `count` primary command buffers for `queue_family` from the calling thread's pool
    ///
    /// Returns the pool together with the buffers; pass both back to
    /// [`release`](Self::release).
    pub fn allocate(&self, queue_family: u32, count: usize) -> VulkanResult<(vk::CommandPool, Vec<vk::CommandBuffer>)> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let id = thread::current().id();

        let entry = match pools.entry((id, queue_family)) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let pool = self.device.create_command_pool(queue_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
                log::debug!("Created command pool {pool:?} for thread {id:?}, queue family {queue_family}");
                vacant.insert(ThreadPool { pool, free: Vec::new(), allocated: 0 })
            }
        };

        let reused = entry.free.len().min(count);
        let mut buffers: Vec<vk::CommandBuffer> = entry.free.drain(..reused).collect();
        let missing = count - reused;
        if missing > 0 {
            let missing = u32::try_from(missing).map_err(|_| VulkanError::invalid("too many command buffers"))?;
            buffers.extend(self.device.allocate_command_buffers(entry.pool, missing)?);
        }
        entry.allocated += count;
        Ok((entry.pool, buffers))
    }

    /// Return a buffer to the free list of the pool it came from
    pub fn release(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = pools.values_mut().find(|entry| entry.pool == pool) {
                entry.free.push(buffer);
                entry.allocated = entry.allocated.saturating_sub(1);
                return;
            }
        }

        let mut orphaned = self.orphaned.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = orphaned.iter().position(|entry| entry.pool == pool) else {
            log::warn!("Released command buffer {buffer:?} from unknown pool {pool:?}");
            return;
        };
        let entry = &mut orphaned[index];
        entry.allocated = entry.allocated.saturating_sub(1);
        if entry.allocated == 0 {
            let entry = orphaned.swap_remove(index);
            self.device.destroy_command_pool(entry.pool);
            log::debug!("Destroyed command pool {pool:?} after its thread exited");
        }
    }

    /// Destroy the calling thread's pools
    ///
    /// Pools with buffers still handed out are destroyed once the last buffer
    /// is released.
    pub fn release_thread_pool(&self) {
        let id = thread::current().id();
        let released: Vec<ThreadPool> = {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<(ThreadId, u32)> = pools.keys().filter(|(owner, _)| *owner == id).copied().collect();
            keys.into_iter().filter_map(|key| pools.remove(&key)).collect()
        };
        for entry in released {
            if entry.allocated == 0 {
                self.device.destroy_command_pool(entry.pool);
                log::debug!("Destroyed command pool {:?} of thread {id:?}", entry.pool);
            } else {
                log::debug!(
                    "Command pool {:?} of thread {id:?} still lends {} buffers; destroying on last release",
                    entry.pool,
                    entry.allocated
                );
                self.orphaned.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
            }
        }
    }

    /// Number of live pools across threads and families
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
            + self.orphaned.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Buffers currently handed out across all pools
    pub fn in_use(&self) -> usize {
        let owned: usize = self.pools.lock().unwrap_or_else(PoisonError::into_inner).values().map(|p| p.allocated).sum();
        let orphaned: usize =
            self.orphaned.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|p| p.allocated).sum();
        owned + orphaned
    }
}

impl Drop for CommandPoolManager {
    fn drop(&mut self) {
        let pools = self.pools.get_mut().unwrap_or_else(PoisonError::into_inner);
        let orphaned = self.orphaned.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in pools.drain().map(|(_, entry)| entry).chain(orphaned.drain(..)) {
            if entry.allocated > 0 {
                log::warn!("Destroying command pool {:?} with {} buffers still in use", entry.pool, entry.allocated);
            }
            self.device.destroy_command_pool(entry.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::MockDevice;

    #[test]
    fn test_released_buffers_are_reused() {
        let mock = MockDevice::new();
        let manager = CommandPoolManager::new(mock.clone());

        let (pool, first) = manager.allocate(0, 2).expect("allocate");
        assert_eq!(first.len(), 2);
        assert_eq!(manager.in_use(), 2);

        manager.release(pool, first[0]);
        let (_, second) = manager.allocate(0, 1).expect("allocate");
        assert_eq!(second[0], first[0]);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_BUFFER), 2);
    }

    #[test]
    fn test_one_pool_per_thread() {
        let mock = MockDevice::new();
        let manager = Arc::new(CommandPoolManager::new(mock.clone()));
        manager.allocate(0, 1).expect("allocate");

        let remote = Arc::clone(&manager);
        std::thread::spawn(move || remote.allocate(0, 1).map(|_| ()))
            .join()
            .expect("thread")
            .expect("allocate");

        assert_eq!(manager.pool_count(), 2);
        drop(manager);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_POOL), 0);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_BUFFER), 0);
    }

    #[test]
    fn test_one_pool_per_queue_family() {
        let mock = MockDevice::new();
        let manager = CommandPoolManager::new(mock.clone());
        let (graphics, _) = manager.allocate(0, 1).expect("graphics");
        let (compute, _) = manager.allocate(1, 1).expect("compute");
        let (again, _) = manager.allocate(0, 1).expect("graphics again");

        assert_ne!(graphics, compute);
        assert_eq!(graphics, again);
        assert_eq!(manager.pool_count(), 2);
    }

    #[test]
    fn test_exiting_thread_releases_its_pool() {
        let mock = MockDevice::new();
        let manager = Arc::new(CommandPoolManager::new(mock.clone()));
        manager.allocate(0, 1).expect("allocate");

        let remote = Arc::clone(&manager);
        std::thread::spawn(move || {
            let (pool, buffers) = remote.allocate(0, 2).expect("allocate");
            for buffer in buffers {
                remote.release(pool, buffer);
            }
            remote.release_thread_pool();
        })
        .join()
        .expect("thread");

        assert_eq!(manager.pool_count(), 1);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_POOL), 1);
        mock.assert_no_violations();
    }

    #[test]
    fn test_pool_with_lent_buffers_outlives_its_thread() {
        let mock = MockDevice::new();
        let manager = Arc::new(CommandPoolManager::new(mock.clone()));

        let remote = Arc::clone(&manager);
        let (pool, buffers) = std::thread::spawn(move || {
            let lent = remote.allocate(0, 2).expect("allocate");
            remote.release_thread_pool();
            lent
        })
        .join()
        .expect("thread");

        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_POOL), 1);
        assert_eq!(manager.in_use(), 2);
        manager.release(pool, buffers[0]);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_POOL), 1);
        manager.release(pool, buffers[1]);
        assert_eq!(mock.live_count(vk::ObjectType::COMMAND_POOL), 0);
        assert_eq!(manager.pool_count(), 0);
        mock.assert_no_violations();
    }
}
