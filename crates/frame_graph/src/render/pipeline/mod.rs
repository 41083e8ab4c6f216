//! Pipelines, shaders and the pipeline cache

mod cache;
mod description;
#[allow(clippy::module_inception)]
mod pipeline;
mod shader;

pub use cache::PipelineCache;
pub use description::{
    AttachmentDescription, BlendMode, DepthState, PipelineDescription, PipelineKind, RenderPassDescription,
    ShaderStageDescription, VertexAttribute, VertexBinding, VertexLayout,
};
pub use pipeline::{Pipeline, SharedPipeline};
pub use shader::ShaderModule;
