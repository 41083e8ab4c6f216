//! Foundation module - Core utilities shared by the renderer
//!
//! - Logging setup and re-exported log macros

pub mod logging;
