//! Background work
//!
//! Asset loading and other resource creation can run on worker threads while
//! the render thread drives the graph; the device context and pools are
//! internally synchronized.

mod thread_manager;

pub use thread_manager::{ExitHook, ThreadManager, WorkerThread};
