//! Render graph driving one frame per [`RenderGraph::update`]
//!
//! Passes are kept in registration order and executed in a stable
//! topological order of their read dependencies: a pass runs after every
//! registered producer it reads, and otherwise keeps its registration slot.
//! Edges are symbolic; each frame they are resolved to semaphores between the
//! passes that actually run, so a pass skipped by its run condition neither
//! signals nor is waited on.
//!
//! # Frame flow
//!
//! 1. Wait on the frame slot's in-flight fence.
//! 2. When a resize is pending, recreate the swapchain and the resize pools
//!    instead of rendering; `update` returns `Ok(false)` for that frame. If a
//!    pooled resource fails to rebuild, the resize stays pending.
//! 3. Acquire an image. An out-of-date swapchain is treated like step 2.
//! 4. Claim the image and reset the frame fence.
//! 5. Execute the active passes, then the swapchain pass, which carries the
//!    frame fence and signals the image's render-finished semaphore.
//! 6. Present and advance to the next frame slot.
//!
//! If anything fails after step 4, the frame is abandoned: a submission
//! without command buffers consumes every semaphore the frame left signaled
//! and signals the frame fence, and the swapchain is flagged for recreation
//! so the acquired image is never presented. The next `update` on the same
//! slot then proceeds normally.

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use indexmap::IndexMap;

use crate::render::api::{AcquireOutcome, RenderContext};
use crate::render::swapchain::Swapchain;

use super::pass::RenderPassNode;
use super::swapchain_pass::{SwapchainPass, SWAPCHAIN_PASS_NAME};
use super::RenderGraphError;

const INITIAL_CAPACITY: usize = 10;

/// What a frame has submitted so far
struct FrameProgress {
    /// Signaled semaphores no submitted work waits on yet
    pending: Vec<vk::Semaphore>,
    /// Whether a successful submit carries the frame fence
    fence_armed: bool,
}

impl FrameProgress {
    fn submitted(&mut self, waits: &[vk::Semaphore], signals: &[vk::Semaphore]) {
        self.pending.retain(|semaphore| !waits.contains(semaphore));
        self.pending.extend_from_slice(signals);
    }
}

/// Collection of passes plus the swapchain presentation pass
pub struct RenderGraph {
    ctx: Arc<RenderContext>,
    passes: IndexMap<String, RenderPassNode>,
    swapchain_pass: Option<SwapchainPass>,
    order: Vec<String>,
    frame_counter: u64,
}

impl RenderGraph {
    /// Empty graph
    pub fn new(ctx: &Arc<RenderContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            passes: IndexMap::with_capacity(INITIAL_CAPACITY),
            swapchain_pass: None,
            order: Vec::with_capacity(INITIAL_CAPACITY),
            frame_counter: 0,
        }
    }

    /// Register a graphics pass
    pub fn add_render_pass(&mut self, pass: RenderPassNode) -> Result<(), RenderGraphError> {
        self.insert(pass)
    }

    /// Register a compute pass; its callback runs once without a render pass
    pub fn add_compute_pass(&mut self, mut pass: RenderPassNode) -> Result<(), RenderGraphError> {
        pass.mark_compute();
        self.insert(pass)
    }

    fn insert(&mut self, mut pass: RenderPassNode) -> Result<(), RenderGraphError> {
        let name = pass.name().to_string();
        if name == SWAPCHAIN_PASS_NAME || self.passes.contains_key(&name) {
            log::error!("Render pass '{name}' already exists in the graph");
            pass.release_provisional_edges();
            return Err(RenderGraphError::DuplicateName(name));
        }

        pass.mark_registered();
        log::debug!("Added {} pass '{name}'", if pass.is_compute() { "compute" } else { "render" });
        self.passes.insert(name, pass);
        self.rebuild_order();
        Ok(())
    }

    /// Declare that registered pass `consumer` reads registered pass `producer`
    pub fn add_dependency(&mut self, consumer: &str, producer: &str) -> Result<(), RenderGraphError> {
        for name in [consumer, producer] {
            if !self.passes.contains_key(name) {
                log::error!("Cannot link '{consumer}' to '{producer}': '{name}' is not registered");
                return Err(RenderGraphError::NotFound(name.to_string()));
            }
        }
        if consumer == producer || self.depends_on(producer, consumer) {
            log::error!("Dependency of '{consumer}' on '{producer}' would create a cycle");
            return Err(RenderGraphError::DependencyCycle {
                consumer: consumer.to_string(),
                producer: producer.to_string(),
            });
        }
        if self.passes.get(consumer).is_some_and(|c| c.read_dependencies().iter().any(|d| d == producer)) {
            return Ok(());
        }
        if self.passes.get(producer).is_some_and(|p| p.dependents().iter().any(|d| d == consumer)) {
            log::error!("An unregistered pass named '{consumer}' already reads '{producer}'");
            return Err(RenderGraphError::DuplicateName(consumer.to_string()));
        }

        if let Some(p) = self.passes.get(producer) {
            p.add_dependent(consumer)?;
        }
        if let Some(c) = self.passes.get_mut(consumer) {
            c.push_read_dependency(producer);
        }
        self.rebuild_order();
        Ok(())
    }

    /// Whether `from` reads `target`, directly or transitively
    fn depends_on(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(name) = stack.pop() {
            if name == target {
                return true;
            }
            if !seen.insert(name) {
                continue;
            }
            if let Some(pass) = self.passes.get(name) {
                stack.extend(pass.read_dependencies().iter().map(String::as_str));
            }
        }
        false
    }

    fn rebuild_order(&mut self) {
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.passes.len());
        let mut order = Vec::with_capacity(self.passes.len());
        while order.len() < self.passes.len() {
            let ready = self.passes.iter().find(|(name, pass)| {
                !placed.contains(name.as_str())
                    && pass
                        .read_dependencies()
                        .iter()
                        .all(|dep| placed.contains(dep.as_str()) || !self.passes.contains_key(dep))
            });
            let Some((name, _)) = ready else {
                log::error!("Render passes form a dependency cycle; remaining passes keep registration order");
                order.extend(self.passes.keys().filter(|name| !placed.contains(name.as_str())).cloned());
                break;
            };
            placed.insert(name.as_str());
            order.push(name.clone());
        }
        self.order = order;
    }

    /// Remove a pass and every edge that points at it
    ///
    /// Waits for the pass's last submission, and for consumers that may still
    /// wait on its semaphores.
    pub fn remove_render_pass(&mut self, name: &str) -> Result<(), RenderGraphError> {
        let Some(pass) = self.passes.get(name) else {
            log::error!("Cannot remove unknown render pass '{name}'");
            return Err(RenderGraphError::NotFound(name.to_string()));
        };
        pass.wait_idle()?;
        for consumer in pass.dependents() {
            if consumer == SWAPCHAIN_PASS_NAME {
                self.ctx.wait_idle()?;
            } else if let Some(consumer) = self.passes.get(consumer.as_str()) {
                consumer.wait_idle()?;
            }
        }

        let Some(pass) = self.passes.shift_remove(name) else {
            return Err(RenderGraphError::NotFound(name.to_string()));
        };
        for producer in pass.read_dependencies() {
            if let Some(producer) = self.passes.get(producer) {
                producer.wait_idle()?;
                producer.remove_dependent(name);
            }
        }
        for consumer in pass.dependents() {
            if consumer == SWAPCHAIN_PASS_NAME {
                if let Some(swapchain_pass) = self.swapchain_pass.as_mut() {
                    swapchain_pass.remove_read_dependency(name);
                }
            } else if let Some(consumer) = self.passes.get_mut(consumer.as_str()) {
                consumer.remove_read_dependency(name);
            }
        }
        self.rebuild_order();
        log::info!("Removed render pass '{name}'");
        Ok(())
    }

    /// Registered pass by name
    pub fn find_render_graph_pass(&self, name: &str) -> Option<&RenderPassNode> {
        self.passes.get(name)
    }

    /// Registered pass by name, mutably
    pub fn find_render_graph_pass_mut(&mut self, name: &str) -> Option<&mut RenderPassNode> {
        self.passes.get_mut(name)
    }

    /// Install the presentation pass, replacing and unlinking any previous one
    pub fn set_swapchain(&mut self, pass: SwapchainPass) -> Result<(), RenderGraphError> {
        if let Some(missing) = pass.read_dependencies().iter().find(|dep| !self.passes.contains_key(*dep)) {
            log::error!("Swapchain pass depends on unknown pass '{missing}'");
            return Err(RenderGraphError::NotFound(missing.clone()));
        }
        if let Some(old) = self.swapchain_pass.take() {
            self.ctx.wait_idle()?;
            for producer in old.read_dependencies() {
                if let Some(producer) = self.passes.get(producer) {
                    producer.remove_dependent(SWAPCHAIN_PASS_NAME);
                }
            }
        }
        for producer in pass.read_dependencies() {
            if let Some(producer) = self.passes.get(producer) {
                producer.add_dependent(SWAPCHAIN_PASS_NAME)?;
            }
        }
        self.swapchain_pass = Some(pass);
        Ok(())
    }

    /// Make the installed swapchain pass read `producer`
    pub fn add_swapchain_dependency(&mut self, producer: &str) -> Result<(), RenderGraphError> {
        let Some(swapchain_pass) = self.swapchain_pass.as_mut() else {
            return Err(RenderGraphError::MissingSwapchainPass);
        };
        let Some(pass) = self.passes.get(producer) else {
            log::error!("Swapchain pass depends on unknown pass '{producer}'");
            return Err(RenderGraphError::NotFound(producer.to_string()));
        };
        if swapchain_pass.read_dependencies().iter().any(|dep| dep == producer) {
            return Ok(());
        }
        pass.add_dependent(SWAPCHAIN_PASS_NAME)?;
        swapchain_pass.push_read_dependency(producer);
        Ok(())
    }

    /// Installed presentation pass
    pub fn swapchain_pass(&self) -> Option<&SwapchainPass> {
        self.swapchain_pass.as_ref()
    }

    /// Record, submit and present one frame
    ///
    /// Returns `Ok(false)` when the frame was spent recreating the swapchain
    /// and pooled resources; the caller skips presentation for it.
    /// `current_frame` advances to the next frame slot after a presented frame.
    ///
    /// When a pass, the swapchain pass or the present fails, the frame slot is
    /// left ready for the next call and a swapchain recreate is scheduled
    /// before the error is returned.
    pub fn update(&mut self, swapchain: &mut Swapchain, current_frame: &mut usize) -> Result<bool, RenderGraphError> {
        if self.swapchain_pass.is_none() {
            log::error!("Render graph updated without a swapchain pass");
            return Err(RenderGraphError::MissingSwapchainPass);
        }
        let frame = *current_frame % swapchain.frames_in_flight();
        swapchain.wait_for_frame(frame)?;

        if swapchain.is_resizing() {
            self.resize(swapchain)?;
            return Ok(false);
        }
        let image = match swapchain.acquire(frame)? {
            AcquireOutcome::OutOfDate => {
                log::warn!("Swapchain out of date on acquire; recreating");
                swapchain.request_resize(swapchain.requested_extent());
                self.resize(swapchain)?;
                return Ok(false);
            }
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    log::warn!("Swapchain suboptimal; recreating after this frame");
                    swapchain.request_resize(swapchain.extent());
                }
                index
            }
        };
        let mut progress =
            FrameProgress { pending: vec![swapchain.image_available_semaphore(frame)?], fence_armed: false };
        if let Err(e) = self.submit_frame(swapchain, frame, image, &mut progress) {
            log::error!("Frame {} failed in slot {frame}: {e}", self.frame_counter + 1);
            if let Err(recovery) = swapchain.abandon_frame(frame, &progress.pending, progress.fence_armed) {
                log::error!("Could not release frame slot {frame}: {recovery}");
            }
            return Err(e);
        }

        *current_frame = (frame + 1) % swapchain.frames_in_flight();
        self.frame_counter += 1;
        log::trace!("Frame {} presented (slot {frame}, image {image})", self.frame_counter);
        Ok(true)
    }

    fn submit_frame(
        &mut self,
        swapchain: &mut Swapchain,
        frame: usize,
        image: u32,
        progress: &mut FrameProgress,
    ) -> Result<(), RenderGraphError> {
        swapchain.begin_frame(frame, image)?;

        let active = self.active_set();
        for name in self.order.clone() {
            if !active.contains(&name) {
                if let Some(pass) = self.passes.get_mut(&name) {
                    pass.record_skip();
                }
                continue;
            }
            let Some(pass) = self.passes.get(&name) else {
                continue;
            };
            let waits = self.resolve_waits(&name, pass.read_dependencies(), &active);
            let signals = pass.signals_for(|consumer| active.contains(consumer) && self.reads(consumer, &name));
            if let Some(pass) = self.passes.get_mut(&name) {
                pass.execute(frame, &waits, &signals)?;
                progress.submitted(&waits, &signals);
            }
        }

        let waits = match &self.swapchain_pass {
            Some(pass) => self.resolve_waits(SWAPCHAIN_PASS_NAME, pass.read_dependencies(), &active),
            None => Vec::new(),
        };
        if let Some(pass) = self.swapchain_pass.as_mut() {
            pass.prepare(swapchain)?;
            pass.execute(swapchain, frame, image, &waits)?;
        }
        // the swapchain submit waited on the image and on every producer still signaled
        progress.pending.clear();
        progress.fence_armed = true;

        swapchain.present(image)?;
        Ok(())
    }

    fn active_set(&self) -> HashSet<String> {
        let mut active: HashSet<String> =
            self.passes.values().filter(|pass| pass.is_enabled()).map(|pass| pass.name().to_string()).collect();
        if self.swapchain_pass.is_some() {
            active.insert(SWAPCHAIN_PASS_NAME.to_string());
        }
        active
    }

    fn reads(&self, consumer: &str, producer: &str) -> bool {
        let deps = if consumer == SWAPCHAIN_PASS_NAME {
            self.swapchain_pass.as_ref().map(SwapchainPass::read_dependencies)
        } else {
            self.passes.get(consumer).map(RenderPassNode::read_dependencies)
        };
        deps.is_some_and(|deps| deps.iter().any(|dep| dep == producer))
    }

    fn resolve_waits(&self, consumer: &str, deps: &[String], active: &HashSet<String>) -> Vec<vk::Semaphore> {
        deps.iter()
            .filter(|dep| active.contains(*dep))
            .filter_map(|dep| self.passes.get(dep)?.semaphore_for(consumer))
            .collect()
    }

    /// Recreate the swapchain, then every pooled framebuffer and image
    ///
    /// A zero-sized request (minimized window) leaves the resize pending. When a
    /// pooled resource fails to rebuild, the resize is requested again so the
    /// next update retries instead of rendering with stale targets.
    pub fn resize(&mut self, swapchain: &mut Swapchain) -> Result<(), RenderGraphError> {
        let requested = swapchain.requested_extent();
        if requested.width == 0 || requested.height == 0 {
            log::debug!("Skipping resize to zero-sized surface");
            return Ok(());
        }

        self.ctx.wait_idle()?;
        swapchain.recreate()?;
        let extent = swapchain.extent();
        let framebuffers = self.ctx.framebuffer_pool().resize_buffers(extent);
        let images = self.ctx.image_pool().resize_images(extent);
        let (framebuffers, images) = match (framebuffers, images) {
            (Ok(framebuffers), Ok(images)) => (framebuffers, images),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Pooled resources failed to resize to {}x{}: {e}", extent.width, extent.height);
                swapchain.request_resize(extent);
                return Err(e.into());
            }
        };
        if let Some(pass) = self.swapchain_pass.as_mut() {
            pass.prepare(swapchain)?;
        }
        log::info!(
            "Resized to {}x{} ({framebuffers} framebuffers, {images} images)",
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Pass names in execution order
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Pass names in registration order
    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.passes.keys().map(String::as_str)
    }

    /// Number of registered passes
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Whether no pass is registered
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Frames presented by this graph
    pub const fn frame_count(&self) -> u64 {
        self.frame_counter
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        if self.passes.values().any(RenderPassNode::has_submitted) {
            if let Err(e) = self.ctx.wait_idle() {
                log::error!("Failed to idle device while dropping render graph: {e}");
            }
        }
    }
}

impl std::fmt::Debug for RenderGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGraph")
            .field("order", &self.order)
            .field("swapchain_pass", &self.swapchain_pass.is_some())
            .field("frames", &self.frame_counter)
            .finish_non_exhaustive()
    }
}
