//! Command pools and command buffer recording

mod command_buffer;
mod command_pool;

pub use command_buffer::{ActiveRenderPass, CommandBuffer};
pub use command_pool::CommandPoolManager;
