//! # Renderer Configuration
//!
//! Start-up parameters for the renderer: application metadata, frames in
//! flight, validation, initial surface extent and where the persisted
//! [`RendererSettings`](super::RendererSettings) live.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Config, DEFAULT_SETTINGS_FILE};

/// Renderer start-up configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Maximum frames the CPU may record ahead of the GPU
    pub max_frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers; `None` follows the build profile
    pub enable_validation: Option<bool>,
    /// Surface extent used until the window reports its own
    pub initial_extent: (u32, u32),
    /// Location of the persisted renderer settings
    pub settings_path: PathBuf,
    /// Clear color of the default presentation pass
    pub clear_color: [f32; 4],
}

impl RendererConfig {
    /// Create a configuration with the given application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self { application_name: application_name.into(), ..Self::default() }
    }

    /// Set frames in flight
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Set validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the initial surface extent
    #[must_use]
    pub const fn with_initial_extent(mut self, width: u32, height: u32) -> Self {
        self.initial_extent = (width, height);
        self
    }

    /// Set the settings file location
    #[must_use]
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }

    /// Set the default clear color
    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }
        if self.max_frames_in_flight == 0 || self.max_frames_in_flight > 8 {
            return Err(format!(
                "max_frames_in_flight must be between 1 and 8, got {}",
                self.max_frames_in_flight
            ));
        }
        if self.initial_extent.0 == 0 || self.initial_extent.1 == 0 {
            return Err(format!("initial_extent must be non-zero, got {:?}", self.initial_extent));
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "Frame Graph Application".to_string(),
            max_frames_in_flight: 2,
            enable_validation: None,
            initial_extent: (1280, 720),
            settings_path: PathBuf::from(DEFAULT_SETTINGS_FILE),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.settings_path, PathBuf::from("renderer.oxconfig"));
    }

    #[test]
    fn test_builder_and_validation() {
        let config = RendererConfig::new("Viewer").with_frames_in_flight(3).with_initial_extent(800, 600);
        assert!(config.validate().is_ok());
        assert_eq!(config.application_name, "Viewer");

        assert!(RendererConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::new("").validate().is_err());
        assert!(RendererConfig::default().with_initial_extent(0, 10).validate().is_err());
    }

    #[test]
    fn test_validation_override() {
        assert!(RendererConfig::default().with_validation(true).validation_enabled());
        assert!(!RendererConfig::default().with_validation(false).validation_enabled());
    }
}
