//! Descriptor pools, set layouts and set updates
//!
//! [`DescriptorPoolManager`] hands out sets from a current pool and grows a
//! fresh pool whenever the current one is exhausted. Exhausted pools move to
//! an in-use list; [`DescriptorPoolManager::reset_all`] returns everything to
//! the free list once the caller knows no set is referenced by in-flight work.
//!
//! Pools are created with `FREE_DESCRIPTOR_SET`, so single sets go back
//! through [`DescriptorPoolManager::free`]. An exhausted pool whose last set
//! is freed moves back to the free list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;

use crate::render::api::{GpuDevice, VulkanError, VulkanResult};

/// Sets per descriptor pool
pub const SETS_PER_POOL: u32 = 256;

const POOL_DESCRIPTOR_TYPES: [vk::DescriptorType; 8] = [
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::INPUT_ATTACHMENT,
];

struct PoolState {
    current: vk::DescriptorPool,
    used: Vec<vk::DescriptorPool>,
    free: Vec<vk::DescriptorPool>,
    owners: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
}

impl PoolState {
    fn live_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.owners.values().filter(|owner| **owner == pool).count()
    }
}

/// Growable descriptor pool allocator
pub struct DescriptorPoolManager {
    device: Arc<dyn GpuDevice>,
    sets_per_pool: u32,
    state: Mutex<PoolState>,
    single_image_layout: vk::DescriptorSetLayout,
}

impl DescriptorPoolManager {
    /// Create a manager with [`SETS_PER_POOL`] sets per pool
    pub fn new(device: Arc<dyn GpuDevice>) -> VulkanResult<Self> {
        Self::with_capacity(device, SETS_PER_POOL)
    }

    /// Create a manager with a custom pool capacity
    pub fn with_capacity(device: Arc<dyn GpuDevice>, sets_per_pool: u32) -> VulkanResult<Self> {
        let single_image_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::ALL)
            .build(device.as_ref())?;
        let current = match create_pool(device.as_ref(), sets_per_pool) {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_descriptor_set_layout(single_image_layout);
                return Err(err);
            }
        };

        Ok(Self {
            device,
            sets_per_pool,
            state: Mutex::new(PoolState { current, used: Vec::new(), free: Vec::new(), owners: HashMap::new() }),
            single_image_layout,
        })
    }

    /// Allocate one set with `layout`, growing a new pool when the current one is full
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match self.device.allocate_descriptor_sets(state.current, &[layout]) {
            Ok(mut sets) => {
                let set = sets.pop().ok_or_else(|| VulkanError::invalid("descriptor allocation returned no sets"))?;
                let pool = state.current;
                state.owners.insert(set, pool);
                return Ok(set);
            }
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)) => {}
            Err(err) => return Err(err),
        }

        let next = match state.free.pop() {
            Some(pool) => pool,
            None => create_pool(self.device.as_ref(), self.sets_per_pool)?,
        };
        let exhausted = std::mem::replace(&mut state.current, next);
        state.used.push(exhausted);
        log::debug!("Descriptor pool exhausted, switched to {next:?} ({} pools in use)", state.used.len() + 1);

        let set = self
            .device
            .allocate_descriptor_sets(state.current, &[layout])?
            .pop()
            .ok_or_else(|| VulkanError::invalid("descriptor allocation returned no sets"))?;
        let pool = state.current;
        state.owners.insert(set, pool);
        Ok(set)
    }

    /// Return a set to the pool it came from
    ///
    /// Sets invalidated by [`reset_all`](Self::reset_all) are ignored.
    pub fn free(&self, set: vk::DescriptorSet) -> VulkanResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = state.owners.remove(&set) else {
            log::debug!("Descriptor set {set:?} was already released");
            return Ok(());
        };
        self.device.free_descriptor_sets(pool, &[set])?;

        if state.live_sets(pool) == 0 {
            if let Some(index) = state.used.iter().position(|used| *used == pool) {
                let drained = state.used.swap_remove(index);
                state.free.push(drained);
                log::debug!("Descriptor pool {drained:?} drained; moved to the free list");
            }
        }
        Ok(())
    }

    /// Reset every pool; all previously allocated sets become invalid
    pub fn reset_all(&self) -> VulkanResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.owners.clear();
        self.device.reset_descriptor_pool(state.current)?;
        let used = std::mem::take(&mut state.used);
        for pool in used {
            self.device.reset_descriptor_pool(pool)?;
            state.free.push(pool);
        }
        Ok(())
    }

    /// Layout with a single combined image sampler at binding 0
    pub const fn single_image_layout(&self) -> vk::DescriptorSetLayout {
        self.single_image_layout
    }

    /// Number of pools created so far
    pub fn pool_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        1 + state.used.len() + state.free.len()
    }

    /// Sets allocated and not yet freed
    pub fn live_sets(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).owners.len()
    }
}

impl Drop for DescriptorPoolManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        self.device.destroy_descriptor_pool(state.current);
        for pool in state.used.drain(..).chain(state.free.drain(..)) {
            self.device.destroy_descriptor_pool(pool);
        }
        self.device.destroy_descriptor_set_layout(self.single_image_layout);
    }
}

fn create_pool(device: &dyn GpuDevice, max_sets: u32) -> VulkanResult<vk::DescriptorPool> {
    let sizes: Vec<vk::DescriptorPoolSize> = POOL_DESCRIPTOR_TYPES
        .iter()
        .map(|ty| vk::DescriptorPoolSize { ty: *ty, descriptor_count: max_sets * 4 })
        .collect();
    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(max_sets)
        .pool_sizes(&sizes);
    device.create_descriptor_pool(&info)
}

/// Builder for descriptor set layouts
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Empty layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single descriptor at `binding`
    #[must_use]
    pub fn add_binding(self, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.add_array_binding(binding, ty, 1, stages)
    }

    /// Add an array of `count` descriptors at `binding`
    #[must_use]
    pub fn add_array_binding(mut self, binding: u32, ty: vk::DescriptorType, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Create the layout
    pub fn build(&self, device: &dyn GpuDevice) -> VulkanResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        device.create_descriptor_set_layout(&info)
    }
}

enum PendingWrite {
    Image(u32, vk::DescriptorType, vk::DescriptorImageInfo),
    Buffer(u32, vk::DescriptorType, vk::DescriptorBufferInfo),
}

/// Batches descriptor writes for one set
pub struct DescriptorWriter {
    set: vk::DescriptorSet,
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    /// Start writing `set`
    pub const fn new(set: vk::DescriptorSet) -> Self {
        Self { set, writes: Vec::new() }
    }

    /// Bind an image
    #[must_use]
    pub fn image(mut self, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorImageInfo) -> Self {
        self.writes.push(PendingWrite::Image(binding, ty, info));
        self
    }

    /// Bind a buffer range
    #[must_use]
    pub fn buffer(mut self, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorBufferInfo) -> Self {
        self.writes.push(PendingWrite::Buffer(binding, ty, info));
        self
    }

    /// Apply all pending writes
    pub fn write(self, device: &dyn GpuDevice) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|pending| match pending {
                PendingWrite::Image(binding, ty, info) => vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info))
                    .build(),
                PendingWrite::Buffer(binding, ty, info) => vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
            })
            .collect();
        device.update_descriptor_sets(&writes);
    }
}
