//! Pipeline cache keyed by description, with shader hot reload

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::render::api::{GpuDevice, VulkanResult};

use super::description::PipelineDescription;
use super::pipeline::{Pipeline, SharedPipeline};

/// Shared pipelines keyed by their full description
pub struct PipelineCache {
    device: Arc<dyn GpuDevice>,
    pipelines: Mutex<HashMap<PipelineDescription, SharedPipeline>>,
}

impl PipelineCache {
    /// Empty cache
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device, pipelines: Mutex::new(HashMap::new()) }
    }

    /// Return the pipeline for `desc`, creating it on first use
    pub fn get_or_create(&self, desc: &PipelineDescription) -> VulkanResult<SharedPipeline> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pipelines.get(desc) {
            return Ok(Arc::clone(existing));
        }
        let pipeline = Arc::new(RwLock::new(Pipeline::new(Arc::clone(&self.device), desc.clone())?));
        pipelines.insert(desc.clone(), Arc::clone(&pipeline));
        log::debug!("Pipeline cache now holds {} pipelines", pipelines.len());
        Ok(pipeline)
    }

    /// Rebuild pipelines whose shader files changed, returning how many succeeded
    ///
    /// The device is idled once before the first rebuild. A pipeline whose new
    /// shaders fail to load keeps running with its previous objects.
    pub fn reload_changed(&self) -> VulkanResult<usize> {
        let stale: Vec<SharedPipeline> = {
            let pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
            pipelines
                .values()
                .filter(|p| p.read().unwrap_or_else(PoisonError::into_inner).is_stale())
                .cloned()
                .collect()
        };
        self.rebuild(&stale)
    }

    /// Rebuild every cached pipeline
    pub fn reload_all(&self) -> VulkanResult<usize> {
        let all: Vec<SharedPipeline> =
            self.pipelines.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        self.rebuild(&all)
    }

    fn rebuild(&self, pipelines: &[SharedPipeline]) -> VulkanResult<usize> {
        if pipelines.is_empty() {
            return Ok(0);
        }
        self.device.wait_idle()?;

        let mut rebuilt = 0;
        for pipeline in pipelines {
            let mut pipeline = pipeline.write().unwrap_or_else(PoisonError::into_inner);
            match pipeline.rebuild() {
                Ok(()) => rebuilt += 1,
                Err(e) => log::error!("Keeping previous '{}' pipeline: {e}", pipeline.description().name),
            }
        }
        Ok(rebuilt)
    }

    /// Number of cached pipelines
    pub fn len(&self) -> usize {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached pipeline; pipelines still shared elsewhere live on
    pub fn clear(&self) {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
