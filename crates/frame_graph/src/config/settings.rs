//! Persisted renderer settings (`renderer.oxconfig`)
//!
//! One table per feature group. Missing keys fall back to their defaults so
//! older files keep loading after new settings are added.

use serde::{Deserialize, Serialize};

use super::Config;

/// File name the renderer reads its settings from
pub const DEFAULT_SETTINGS_FILE: &str = "renderer.oxconfig";

/// `[display]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Present with FIFO instead of MAILBOX/IMMEDIATE
    pub vsync: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self { vsync: true }
    }
}

/// `[debug]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Draw the debug line renderer
    pub debug_renderer: bool,
    /// Draw object bounding boxes
    pub bounding_boxes: bool,
}

/// `[color]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    /// Tonemapping operator index
    pub tonemapper: i32,
    /// Exposure multiplier
    pub exposure: f32,
    /// Display gamma
    pub gamma: f32,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self { tonemapper: 0, exposure: 1.0, gamma: 2.2 }
    }
}

/// `[gtao]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GtaoSettings {
    /// Ambient occlusion pass enabled
    pub enabled: bool,
}

impl Default for GtaoSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `[bloom]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomSettings {
    /// Bloom passes enabled
    pub enabled: bool,
    /// Luminance threshold for the prefilter
    pub threshold: f32,
}

impl Default for BloomSettings {
    fn default() -> Self {
        Self { enabled: true, threshold: 1.0 }
    }
}

/// `[ssr]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsrSettings {
    /// Screen-space reflections enabled
    pub enabled: bool,
}

impl Default for SsrSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `[shadows]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowSettings {
    /// Shadow map edge length in texels
    pub size: i32,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self { size: 4096 }
    }
}

/// `[fxaa]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FxaaSettings {
    /// FXAA pass enabled
    pub enabled: bool,
}

impl Default for FxaaSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Renderer settings persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Presentation options
    pub display: DisplaySettings,
    /// Debug drawing toggles
    pub debug: DebugSettings,
    /// Color grading
    pub color: ColorSettings,
    /// Ground-truth ambient occlusion
    pub gtao: GtaoSettings,
    /// Bloom
    pub bloom: BloomSettings,
    /// Screen-space reflections
    pub ssr: SsrSettings,
    /// Shadow maps
    pub shadows: ShadowSettings,
    /// Anti-aliasing
    pub fxaa: FxaaSettings,
}

impl Config for RendererSettings {}

impl RendererSettings {
    /// Check ranges that the serializer cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.shadows.size <= 0 || !(self.shadows.size as u32).is_power_of_two() {
            return Err(format!("shadows.size must be a positive power of two, got {}", self.shadows.size));
        }
        if self.color.gamma <= 0.0 {
            return Err(format!("color.gamma must be positive, got {}", self.color.gamma));
        }
        if self.color.exposure < 0.0 {
            return Err(format!("color.exposure must not be negative, got {}", self.color.exposure));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);

        let settings = RendererSettings::load_or_create(&path).expect("load");
        assert_eq!(settings, RendererSettings::default());
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).expect("read back");
        assert!(written.contains("[display]"));
        assert!(written.contains("vsync = true"));
        assert!(written.contains("[shadows]"));
    }

    #[test]
    fn test_loads_observed_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        std::fs::write(
            &path,
            r#"
[display]
vsync = false

[debug]
debug_renderer = true
bounding_boxes = true

[color]
tonemapper = 2
exposure = 1.5
gamma = 2.4

[gtao]
enabled = false

[bloom]
enabled = false
threshold = 0.8

[ssr]
enabled = false

[shadows]
size = 2048

[fxaa]
enabled = false
"#,
        )
        .expect("write");

        let settings = RendererSettings::load_from_file(&path).expect("load");
        assert!(!settings.display.vsync);
        assert!(settings.debug.debug_renderer);
        assert!(settings.debug.bounding_boxes);
        assert_eq!(settings.color.tonemapper, 2);
        assert!((settings.color.exposure - 1.5).abs() < f32::EPSILON);
        assert!((settings.color.gamma - 2.4).abs() < f32::EPSILON);
        assert!(!settings.gtao.enabled);
        assert!(!settings.bloom.enabled);
        assert!((settings.bloom.threshold - 0.8).abs() < f32::EPSILON);
        assert!(!settings.ssr.enabled);
        assert_eq!(settings.shadows.size, 2048);
        assert!(!settings.fxaa.enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        std::fs::write(&path, "[bloom]\nthreshold = 3.0\n").expect("write");

        let settings = RendererSettings::load_from_file(&path).expect("load");
        assert!(settings.bloom.enabled);
        assert!((settings.bloom.threshold - 3.0).abs() < f32::EPSILON);
        assert_eq!(settings.display, DisplaySettings::default());
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("renderer.ron");
        let mut settings = RendererSettings::default();
        settings.shadows.size = 1024;
        settings.save_to_file(&path).expect("save");

        let loaded = RendererSettings::load_from_file(&path).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        std::fs::write(&path, "[display\nvsync = ").expect("write");

        assert!(matches!(RendererSettings::load_from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_shadow_size() {
        let mut settings = RendererSettings::default();
        settings.shadows.size = 1000;
        assert!(settings.validate().is_err());
        settings.shadows.size = 0;
        assert!(settings.validate().is_err());
    }
}
