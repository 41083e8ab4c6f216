//! Pipeline objects built from a [`PipelineDescription`]

use std::ffi::CString;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use ash::vk::{self, Handle};

use crate::render::api::{GpuDevice, VulkanError, VulkanResult};

use super::description::{BlendMode, PipelineDescription, PipelineKind};
use super::shader::{modified_time, ShaderModule};

/// Pipeline shared between the cache and passes
pub type SharedPipeline = Arc<RwLock<Pipeline>>;

/// Pipeline with its layout and, for graphics, its render pass
///
/// Viewport and scissor are dynamic so a pipeline survives surface resizes.
pub struct Pipeline {
    device: Arc<dyn GpuDevice>,
    desc: PipelineDescription,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    shader_times: Vec<Option<SystemTime>>,
}

struct Built {
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    shader_times: Vec<Option<SystemTime>>,
}

impl Pipeline {
    /// Create the render pass, layout and pipeline
    pub fn new(device: Arc<dyn GpuDevice>, desc: PipelineDescription) -> VulkanResult<Self> {
        let render_pass = match (&desc.kind, &desc.render_pass) {
            (PipelineKind::Graphics, Some(rp)) => rp.build(device.as_ref())?,
            (PipelineKind::Graphics, None) if !desc.shaders.is_empty() => {
                return Err(VulkanError::invalid(format!("Graphics pipeline '{}' has no render pass", desc.name)));
            }
            _ => vk::RenderPass::null(),
        };
        if render_pass != vk::RenderPass::null() {
            device.set_object_name(vk::ObjectType::RENDER_PASS, render_pass.as_raw(), &desc.name);
        }

        let mut pipeline = Self {
            device,
            desc,
            render_pass,
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            shader_times: Vec::new(),
        };
        if !pipeline.desc.shaders.is_empty() {
            let built = pipeline.build()?;
            pipeline.install(built);
        }
        log::debug!("Created pipeline '{}'", pipeline.desc.name);
        Ok(pipeline)
    }

    fn build(&self) -> VulkanResult<Built> {
        let shader_times = self.desc.shaders.iter().map(|s| modified_time(&s.path)).collect();
        let modules = self
            .desc
            .shaders
            .iter()
            .map(|s| ShaderModule::from_file(Arc::clone(&self.device), &s.path))
            .collect::<VulkanResult<Vec<_>>>()?;
        let entry_points = self
            .desc
            .shaders
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| VulkanError::invalid(format!("Bad entry point in '{}': {e}", self.desc.name)))?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .desc
            .shaders
            .iter()
            .zip(&modules)
            .zip(&entry_points)
            .map(|((s, module), entry)| module.stage_info(s.stage, entry))
            .collect();

        let push_ranges = [vk::PushConstantRange {
            stage_flags: self.desc.push_constant_stages,
            offset: 0,
            size: self.desc.push_constant_size,
        }];
        let ranges: &[vk::PushConstantRange] = if self.desc.push_constant_size > 0 { &push_ranges } else { &[] };
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&self.desc.set_layouts).push_constant_ranges(ranges);
        let layout = self.device.create_pipeline_layout(&layout_info)?;

        let pipeline = match self.desc.kind {
            PipelineKind::Graphics => self.build_graphics(&stages, layout),
            PipelineKind::Compute => match stages.first() {
                Some(stage) => {
                    let info = vk::ComputePipelineCreateInfo::builder().stage(*stage).layout(layout).build();
                    self.device.create_compute_pipeline(&info)
                }
                None => Err(VulkanError::invalid(format!("Compute pipeline '{}' has no shader", self.desc.name))),
            },
        };
        match pipeline {
            Ok(pipeline) => Ok(Built { layout, pipeline, shader_times }),
            Err(e) => {
                self.device.destroy_pipeline_layout(layout);
                Err(e)
            }
        }
    }

    fn build_graphics(
        &self,
        stages: &[vk::PipelineShaderStageCreateInfo],
        layout: vk::PipelineLayout,
    ) -> VulkanResult<vk::Pipeline> {
        let bindings: Vec<vk::VertexInputBindingDescription> = self
            .desc
            .vertex_layout
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription { binding: b.binding, stride: b.stride, input_rate: b.input_rate })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = self
            .desc
            .vertex_layout
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.desc.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.desc.depth.test)
            .depth_write_enable(self.desc.depth.write)
            .depth_compare_op(self.desc.depth.compare);

        let color_count = self.desc.render_pass.as_ref().map_or(1, |rp| rp.color_attachments.len());
        let blend_attachments = vec![blend_attachment(self.desc.blend); color_count];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(0)
            .build();
        self.device.create_graphics_pipeline(&info)
    }

    fn install(&mut self, built: Built) {
        self.release_pipeline();
        self.layout = built.layout;
        self.pipeline = built.pipeline;
        self.shader_times = built.shader_times;
        if self.pipeline != vk::Pipeline::null() {
            self.device.set_object_name(vk::ObjectType::PIPELINE, self.pipeline.as_raw(), &self.desc.name);
        }
    }

    fn release_pipeline(&mut self) {
        if self.pipeline != vk::Pipeline::null() {
            self.device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            self.device.destroy_pipeline_layout(self.layout);
            self.layout = vk::PipelineLayout::null();
        }
    }

    /// Reload shaders and rebuild the pipeline in place
    ///
    /// The render pass is kept so existing framebuffers stay compatible. On
    /// failure the previous pipeline remains bound and usable.
    pub fn rebuild(&mut self) -> VulkanResult<()> {
        if self.desc.shaders.is_empty() {
            return Ok(());
        }
        match self.build() {
            Ok(built) => {
                self.install(built);
                log::info!("Rebuilt pipeline '{}'", self.desc.name);
                Ok(())
            }
            Err(e) => {
                // remember the failed sources so the same edit is not retried every frame
                self.shader_times = self.desc.shaders.iter().map(|s| modified_time(&s.path)).collect();
                Err(e)
            }
        }
    }

    /// Whether any shader source changed since the last build attempt
    pub fn is_stale(&self) -> bool {
        self.desc
            .shaders
            .iter()
            .zip(&self.shader_times)
            .any(|(s, recorded)| modified_time(&s.path) != *recorded)
    }

    /// Pipeline handle; null for render-pass-only descriptions
    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Render pass; null for compute pipelines
    pub const fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Bind point
    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        self.desc.bind_point()
    }

    /// Creation parameters
    pub const fn description(&self) -> &PipelineDescription {
        &self.desc
    }
}

fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let base = vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA);
    match mode {
        BlendMode::Opaque => base.blend_enable(false),
        BlendMode::Alpha => base
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => base
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
    .build()
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release_pipeline();
        if self.render_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.render_pass);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.desc.name)
            .field("kind", &self.desc.kind)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::render::pipeline::description::{AttachmentDescription, RenderPassDescription};
    use crate::render::testing::{write_spirv, MockDevice};

    fn color_pass() -> RenderPassDescription {
        RenderPassDescription {
            color_attachments: vec![AttachmentDescription::color(
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
            depth_attachment: None,
        }
    }

    fn shaders(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let vert = dir.join("quad.vert.spv");
        let frag = dir.join("quad.frag.spv");
        write_spirv(&vert, true);
        write_spirv(&frag, true);
        (vert, frag)
    }

    #[test]
    fn test_graphics_pipeline_owns_objects() {
        let mock = MockDevice::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let (vert, frag) = shaders(dir.path());

        let pipeline = Pipeline::new(
            mock.clone(),
            PipelineDescription::graphics("quad", vert, frag).with_render_pass(color_pass()).with_push_constants(16),
        )
        .expect("pipeline");
        assert_ne!(pipeline.handle(), vk::Pipeline::null());
        assert_ne!(pipeline.render_pass(), vk::RenderPass::null());
        // shader modules are only needed while building
        assert_eq!(mock.live_count(vk::ObjectType::SHADER_MODULE), 0);

        drop(pipeline);
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE), 0);
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE_LAYOUT), 0);
        assert_eq!(mock.live_count(vk::ObjectType::RENDER_PASS), 0);
        mock.assert_no_violations();
    }

    #[test]
    fn test_graphics_without_render_pass_rejected() {
        let mock = MockDevice::new();
        let result = Pipeline::new(mock, PipelineDescription::graphics("broken", "a.spv", "b.spv"));
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_render_pass_only() {
        let mock = MockDevice::new();
        let pipeline =
            Pipeline::new(mock.clone(), PipelineDescription::render_pass_only("clear", color_pass())).expect("pass");
        assert_eq!(pipeline.handle(), vk::Pipeline::null());
        assert_ne!(pipeline.render_pass(), vk::RenderPass::null());
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE_LAYOUT), 0);
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_pipeline() {
        let mock = MockDevice::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let shader = dir.path().join("blur.comp.spv");
        write_spirv(&shader, true);

        let mut pipeline = Pipeline::new(mock.clone(), PipelineDescription::compute("blur", &shader)).expect("pipeline");
        let original = pipeline.handle();

        write_spirv(&shader, false);
        assert!(pipeline.rebuild().is_err());
        assert_eq!(pipeline.handle(), original);
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE), 1);
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE_LAYOUT), 1);

        write_spirv(&shader, true);
        pipeline.rebuild().expect("rebuild");
        assert_ne!(pipeline.handle(), original);
        assert_eq!(mock.live_count(vk::ObjectType::PIPELINE), 1);
    }
}
