//! Render pass nodes
//!
//! A node is one unit of GPU work: a command buffer per frame slot, the
//! framebuffers it renders to, an optional pipeline and the callback that
//! records draws or dispatches. Graphics nodes call the callback once per
//! framebuffer inside a render pass; compute nodes call it once with no render
//! pass. Inner passes are recorded into the owner's command buffer after the
//! owner's own framebuffers and are never submitted on their own.
//!
//! # Dependencies
//!
//! Dependencies are kept as pass names and only resolved to semaphores when
//! the graph submits. A producer keeps one signal semaphore per consumer, in
//! the order consumers declared the edge, because a binary semaphore can
//! satisfy a single wait. Slot 0 exists from construction so a node always has
//! a signal semaphore.
//!
//! [`RenderPassNode::add_read_dependency`] wires the edge into the producer at
//! once, before the consumer is registered. Until the consumer is added to the
//! graph those edges are provisional: dropping the node, or having it rejected
//! as a duplicate, takes them back out of the producers.
//!
//! # Synchronization
//!
//! Each node owns a completion fence. It is waited on before the next
//! recording only when the previous submit succeeded, and reset immediately
//! before the next submit, so a failed frame never leaves the node waiting on
//! a fence nothing will signal. The first execution skips the wait entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use ash::vk;

use crate::render::api::{RenderContext, VulkanError, VulkanResult};
use crate::render::commands::CommandBuffer;
use crate::render::pipeline::{Pipeline, SharedPipeline};
use crate::render::resources::SharedFramebuffer;
use crate::render::sync::{Fence, Semaphore};

use super::{RenderGraph, RenderGraphError};

/// Records the commands of a pass; called once per framebuffer, or once for compute
pub type PassExecuteFn = Box<dyn FnMut(&PassContext<'_>) + Send>;

/// What a pass callback records into
pub struct PassContext<'a> {
    /// Command buffer, inside the render pass for graphics passes
    pub command_buffer: &'a CommandBuffer,
    /// Frame slot being recorded
    pub frame_index: usize,
    /// Index of the framebuffer being rendered; 0 for compute
    pub framebuffer_index: usize,
    /// Area of the current render pass
    pub render_area: vk::Rect2D,
    /// Pipeline of the pass, already bound when it has one
    pub pipeline: Option<&'a Pipeline>,
}

/// CPU-side counters for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Frames the pass was recorded and submitted
    pub executions: u64,
    /// Frames skipped by the run condition
    pub skipped: u64,
    /// Recording time of the last execution
    pub last_record_time: Duration,
}

/// Recording state shared by top-level and inner passes
struct Recorder {
    pipeline: Option<SharedPipeline>,
    framebuffers: Vec<SharedFramebuffer>,
    execute: PassExecuteFn,
    clear_values: Vec<vk::ClearValue>,
    render_area: Option<vk::Rect2D>,
    is_compute: bool,
}

impl Recorder {
    fn record(&mut self, cmd: &CommandBuffer, frame: usize) -> VulkanResult<()> {
        let guard = self.pipeline.as_ref().map(|p| p.read().unwrap_or_else(PoisonError::into_inner));
        let pipeline = guard.as_deref();
        let bound = pipeline.filter(|p| p.handle() != vk::Pipeline::null());

        if self.is_compute {
            if let Some(p) = bound {
                cmd.bind_pipeline(p.bind_point(), p.handle());
            }
            (self.execute)(&PassContext {
                command_buffer: cmd,
                frame_index: frame,
                framebuffer_index: 0,
                render_area: self.render_area.unwrap_or_default(),
                pipeline,
            });
            return Ok(());
        }

        for (index, framebuffer) in self.framebuffers.iter().enumerate() {
            let framebuffer = framebuffer.read().unwrap_or_else(PoisonError::into_inner);
            let area = self
                .render_area
                .unwrap_or(vk::Rect2D { offset: vk::Offset2D::default(), extent: framebuffer.extent() });
            let render_pass = pipeline
                .map(Pipeline::render_pass)
                .filter(|rp| *rp != vk::RenderPass::null())
                .unwrap_or_else(|| framebuffer.render_pass());

            let active = cmd.begin_render_pass(render_pass, framebuffer.handle(), area, &self.clear_values)?;
            if let Some(p) = bound {
                active.bind_pipeline(p.bind_point(), p.handle());
                active.set_viewport_and_scissor(area);
            }
            (self.execute)(&PassContext {
                command_buffer: &*active,
                frame_index: frame,
                framebuffer_index: index,
                render_area: area,
                pipeline,
            });
        }
        Ok(())
    }
}

/// Consumers of a producer, each paired with the semaphore signaled for it
struct Edges {
    dependents: Vec<String>,
    signal_semaphores: Vec<Semaphore>,
}

impl Edges {
    fn remove(&mut self, consumer: &str) -> bool {
        let Some(slot) = self.dependents.iter().rposition(|d| d == consumer) else {
            return false;
        };
        self.dependents.remove(slot);
        if self.signal_semaphores.len() > 1 {
            self.signal_semaphores.remove(slot);
        }
        true
    }
}

/// Named unit of GPU work in a [`RenderGraph`]
pub struct RenderPassNode {
    ctx: Arc<RenderContext>,
    name: String,
    command_buffers: Vec<CommandBuffer>,
    recorder: Recorder,
    queue: vk::Queue,
    wait_stage: vk::PipelineStageFlags,
    inner_passes: Vec<RenderPassNode>,
    read_dependencies: Vec<String>,
    edges: Arc<Mutex<Edges>>,
    provisional_edges: Vec<Weak<Mutex<Edges>>>,
    run_condition: Option<Arc<AtomicBool>>,
    fence: Fence,
    fence_pending: bool,
    has_submitted: bool,
    stats: PassStats,
}

impl RenderPassNode {
    /// Create a pass from caller-allocated resources
    ///
    /// `command_buffers` holds one buffer per frame slot, at least one, all
    /// allocated for the family of `queue`. The fence and the first signal
    /// semaphore are created here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &Arc<RenderContext>,
        name: impl Into<String>,
        command_buffers: Vec<CommandBuffer>,
        pipeline: Option<SharedPipeline>,
        framebuffers: Vec<SharedFramebuffer>,
        execute: PassExecuteFn,
        clear_values: Vec<vk::ClearValue>,
        queue: vk::Queue,
    ) -> VulkanResult<Self> {
        let name = name.into();
        if command_buffers.is_empty() {
            return Err(VulkanError::invalid(format!("Pass '{name}' needs at least one command buffer")));
        }
        let family = ctx
            .device()
            .queue_family(queue)
            .ok_or_else(|| VulkanError::invalid(format!("Pass '{name}' submits to unknown queue {queue:?}")))?;
        if let Some(mismatched) = command_buffers.iter().find(|cmd| cmd.queue_family() != family) {
            return Err(VulkanError::invalid(format!(
                "Pass '{name}' records for queue family {} but submits to family {family}",
                mismatched.queue_family()
            )));
        }
        let fence = Fence::new(Arc::clone(ctx.device()), false)?;
        let semaphore = Semaphore::new(Arc::clone(ctx.device()))?;
        log::debug!("Created render pass node '{name}'");
        Ok(Self {
            ctx: Arc::clone(ctx),
            name,
            command_buffers,
            recorder: Recorder { pipeline, framebuffers, execute, clear_values, render_area: None, is_compute: false },
            queue,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            inner_passes: Vec::new(),
            read_dependencies: Vec::new(),
            edges: Arc::new(Mutex::new(Edges { dependents: Vec::new(), signal_semaphores: vec![semaphore] })),
            provisional_edges: Vec::new(),
            run_condition: None,
            fence,
            fence_pending: false,
            has_submitted: false,
            stats: PassStats::default(),
        })
    }

    /// Nest a pass recorded into this node's command buffer after its own framebuffers
    ///
    /// The nested pass never submits, so edges it declared are dropped.
    pub fn add_inner_pass(&mut self, mut pass: RenderPassNode) {
        log::debug!("Pass '{}' nested under '{}'", pass.name, self.name);
        pass.release_provisional_edges();
        self.inner_passes.push(pass);
    }

    /// Declare that this pass reads the output of `name` in `graph`
    ///
    /// The producer gains a signal semaphore slot for this pass right away;
    /// the slot is released again if this node is dropped without being
    /// registered. Fails with `NotFound` when `name` is not registered, leaving
    /// this node unchanged.
    pub fn add_read_dependency(&mut self, graph: &mut RenderGraph, name: &str) -> Result<(), RenderGraphError> {
        if name == self.name {
            log::error!("Pass '{name}' cannot depend on itself");
            return Err(RenderGraphError::DependencyCycle { consumer: self.name.clone(), producer: name.to_string() });
        }
        if self.read_dependencies.iter().any(|dep| dep == name) {
            return Ok(());
        }
        let Some(producer) = graph.find_render_graph_pass(name) else {
            log::error!("Pass '{}' depends on unknown pass '{name}'", self.name);
            return Err(RenderGraphError::NotFound(name.to_string()));
        };
        if producer.edges().dependents.iter().any(|d| *d == self.name) {
            log::error!("Another pass named '{}' already reads '{name}'", self.name);
            return Err(RenderGraphError::DuplicateName(self.name.clone()));
        }
        producer.add_dependent(&self.name)?;
        self.provisional_edges.push(Arc::downgrade(&producer.edges));
        self.read_dependencies.push(name.to_string());
        Ok(())
    }

    /// Override the full-framebuffer render area
    pub fn set_render_area(&mut self, area: vk::Rect2D) {
        self.recorder.render_area = Some(area);
    }

    /// Skip the pass entirely while `condition` reads false
    pub fn run_with_condition(&mut self, condition: Arc<AtomicBool>) {
        self.run_condition = Some(condition);
    }

    /// Stage at which this pass waits on its dependencies
    pub fn set_wait_stage(&mut self, stage: vk::PipelineStageFlags) {
        self.wait_stage = stage;
    }

    /// Register as a graphics pass
    pub fn add_to_graph(self, graph: &mut RenderGraph) -> Result<(), RenderGraphError> {
        graph.add_render_pass(self)
    }

    /// Register as a compute pass
    pub fn add_to_graph_compute(self, graph: &mut RenderGraph) -> Result<(), RenderGraphError> {
        graph.add_compute_pass(self)
    }

    pub(crate) fn mark_compute(&mut self) {
        self.recorder.is_compute = true;
        self.wait_stage = vk::PipelineStageFlags::COMPUTE_SHADER;
    }

    fn edges(&self) -> MutexGuard<'_, Edges> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_dependent(&self, consumer: &str) -> VulkanResult<()> {
        let mut edges = self.edges();
        if edges.dependents.len() == edges.signal_semaphores.len() {
            edges.signal_semaphores.push(Semaphore::new(Arc::clone(self.ctx.device()))?);
        }
        edges.dependents.push(consumer.to_string());
        log::debug!("Pass '{}' now signals '{consumer}'", self.name);
        Ok(())
    }

    /// Drop the edge to `consumer`; the caller guarantees no submission still uses its semaphore
    pub(crate) fn remove_dependent(&self, consumer: &str) -> bool {
        self.edges().remove(consumer)
    }

    /// The graph owns this node's edges from now on
    pub(crate) fn mark_registered(&mut self) {
        self.provisional_edges.clear();
    }

    /// Take the edges added by `add_read_dependency` back out of their producers
    pub(crate) fn release_provisional_edges(&mut self) {
        for producer in self.provisional_edges.drain(..) {
            if let Some(edges) = producer.upgrade() {
                if edges.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.name) {
                    log::debug!("Released provisional edge of unregistered pass '{}'", self.name);
                }
            }
        }
    }

    pub(crate) fn push_read_dependency(&mut self, producer: &str) {
        self.read_dependencies.push(producer.to_string());
    }

    pub(crate) fn remove_read_dependency(&mut self, producer: &str) -> bool {
        let before = self.read_dependencies.len();
        self.read_dependencies.retain(|dep| dep != producer);
        before != self.read_dependencies.len()
    }

    /// Semaphore the producer signals for `consumer`
    pub(crate) fn semaphore_for(&self, consumer: &str) -> Option<vk::Semaphore> {
        let edges = self.edges();
        let slot = edges.dependents.iter().position(|d| d == consumer)?;
        edges.signal_semaphores.get(slot).map(Semaphore::handle)
    }

    /// Semaphores for the consumers in `active`, in declaration order
    pub(crate) fn signals_for(&self, is_active: impl Fn(&str) -> bool) -> Vec<vk::Semaphore> {
        let edges = self.edges();
        edges
            .dependents
            .iter()
            .zip(&edges.signal_semaphores)
            .filter(|(consumer, _)| is_active(consumer))
            .map(|(_, semaphore)| semaphore.handle())
            .collect()
    }

    /// Wait for the last successful submission of this pass, if any
    pub(crate) fn wait_idle(&self) -> VulkanResult<()> {
        if self.fence_pending {
            self.fence.wait(u64::MAX)?;
        }
        Ok(())
    }

    pub(crate) fn record_skip(&mut self) {
        self.stats.skipped += 1;
        log::trace!("Pass '{}' skipped by its run condition", self.name);
    }

    /// Record and submit this pass for frame slot `frame`
    ///
    /// On error nothing was submitted: `waits` are still pending and `signals`
    /// were not signaled.
    pub(crate) fn execute(&mut self, frame: usize, waits: &[vk::Semaphore], signals: &[vk::Semaphore]) -> VulkanResult<()> {
        if self.fence_pending {
            self.fence.wait(u64::MAX)?;
            self.fence_pending = false;
        }

        let started = Instant::now();
        let slot = frame % self.command_buffers.len();
        let cmd = &mut self.command_buffers[slot];
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.begin_label(&self.name);
        let mut recorded = self.recorder.record(cmd, frame);
        for inner in &mut self.inner_passes {
            if recorded.is_err() {
                break;
            }
            cmd.begin_label(&inner.name);
            recorded = inner.recorder.record(cmd, frame);
            cmd.end_label();
        }
        cmd.end_label();
        if let Err(e) = recorded {
            cmd.abandon();
            log::error!("Recording pass '{}' failed: {e}", self.name);
            return Err(e);
        }
        cmd.end()?;
        self.stats.last_record_time = started.elapsed();

        if self.has_submitted {
            self.fence.reset()?;
        }
        let stages = vec![self.wait_stage; waits.len()];
        cmd.submit(self.queue, waits, &stages, signals, self.fence.handle())?;
        self.fence_pending = true;
        self.has_submitted = true;
        self.stats.executions += 1;
        log::trace!(
            "Submitted pass '{}' (frame {frame}, {} waits, {} signals)",
            self.name,
            waits.len(),
            signals.len()
        );
        Ok(())
    }

    /// Pass name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the run condition currently allows execution
    pub fn is_enabled(&self) -> bool {
        self.run_condition.as_ref().map_or(true, |flag| flag.load(Ordering::Acquire))
    }

    /// Whether another pass reads this one
    pub fn has_dependency(&self) -> bool {
        !self.edges().dependents.is_empty()
    }

    /// Whether the pass has been submitted at least once
    pub const fn has_submitted(&self) -> bool {
        self.has_submitted
    }

    /// Whether the pass runs without render pass wrapping
    pub const fn is_compute(&self) -> bool {
        self.recorder.is_compute
    }

    /// Declared producers
    pub fn read_dependencies(&self) -> &[String] {
        &self.read_dependencies
    }

    /// Consumers, in declaration order
    pub fn dependents(&self) -> Vec<String> {
        self.edges().dependents.clone()
    }

    /// Semaphores this pass waits on, resolved against `graph`
    ///
    /// One entry per declared dependency whose producer is registered.
    pub fn wait_semaphores(&self, graph: &RenderGraph) -> Vec<vk::Semaphore> {
        self.read_dependencies
            .iter()
            .filter_map(|dep| graph.find_render_graph_pass(dep)?.semaphore_for(&self.name))
            .collect()
    }

    /// First signal semaphore
    pub fn signal_semaphore(&self) -> vk::Semaphore {
        self.edges().signal_semaphores.first().map_or_else(vk::Semaphore::null, Semaphore::handle)
    }

    /// Number of signal semaphore slots
    pub fn signal_semaphore_count(&self) -> usize {
        self.edges().signal_semaphores.len()
    }

    /// Completion fence
    pub const fn fence(&self) -> vk::Fence {
        self.fence.handle()
    }

    /// Command buffer handle of a frame slot
    pub fn command_buffer(&self, slot: usize) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(slot).map(CommandBuffer::handle)
    }

    /// Nested passes
    pub fn inner_passes(&self) -> &[RenderPassNode] {
        &self.inner_passes
    }

    /// Framebuffers rendered to
    pub fn framebuffers(&self) -> &[SharedFramebuffer] {
        &self.recorder.framebuffers
    }

    /// Counters
    pub const fn stats(&self) -> &PassStats {
        &self.stats
    }
}

impl std::fmt::Debug for RenderPassNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPassNode")
            .field("name", &self.name)
            .field("compute", &self.recorder.is_compute)
            .field("reads", &self.read_dependencies)
            .field("dependents", &self.edges().dependents)
            .field("has_submitted", &self.has_submitted)
            .finish_non_exhaustive()
    }
}

impl Drop for RenderPassNode {
    fn drop(&mut self) {
        self.release_provisional_edges();
    }
}
