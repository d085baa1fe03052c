//! Engine configuration
//!
//! Configuration is loaded from multiple sources with the following priority (lowest to highest):
//! 1. `config/default.toml`
//! 2. `config/user.toml` (user overrides)
//! 3. Environment variables (`MPR_SECTION__KEY`)

use crate::enums::{CompositingMode, SlabMode};
use crate::error::ConfigError;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub compositing: CompositingConfig,
    #[serde(default)]
    pub window_level: WindowLevelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub slab: SlabSettings,
}

impl EngineConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific config directory. Missing files
    /// fall back to the built-in defaults.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let default_path = config_dir.join("default.toml");
        let user_path = config_dir.join("user.toml");

        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

        if default_path.exists() {
            figment = figment.merge(Toml::file(&default_path));
        }

        if user_path.exists() {
            figment = figment.merge(Toml::file(&user_path));
        }

        // MPR_GEOMETRY__ROTATED_TOLERANCE_DEGREES=0.5 -> geometry.rotated_tolerance_degrees
        figment = figment.merge(Env::prefixed("MPR_").split("__"));

        figment.extract().map_err(ConfigError::from)
    }
}

/// Cutting-plane geometry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Largest angle between the slice normal and a volume axis that still
    /// counts as parallel when mapping offsets to slice indices
    pub rotated_tolerance_degrees: f64,
    /// Field of view (mm) of a freshly created slice view
    pub default_field_of_view: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            rotated_tolerance_degrees: 0.1,
            default_field_of_view: 250.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositingConfig {
    pub mode: CompositingMode,
    pub foreground_opacity: f64,
    pub label_opacity: f64,
    pub clip_to_background_volume: bool,
    /// Edge length of a checkerboard tile in output pixels
    pub checkerboard_tile_size: u32,
}

impl Default for CompositingConfig {
    fn default() -> Self {
        Self {
            mode: CompositingMode::AlphaBlend,
            foreground_opacity: 0.0,
            label_opacity: 1.0,
            clip_to_background_volume: true,
            checkerboard_tile_size: 32,
        }
    }
}

/// Percentiles of the intensity histogram used for automatic window/level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowLevelConfig {
    pub auto_low_percentile: f64,
    pub auto_high_percentile: f64,
}

impl Default for WindowLevelConfig {
    fn default() -> Self {
        Self {
            auto_low_percentile: 0.1,
            auto_high_percentile: 99.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fit the field of view to the background volume whenever it changes
    pub fit_on_background_change: bool,
    /// Follow-up rebuild passes allowed for notifications that arrive
    /// while a rebuild is running
    pub max_follow_up_passes: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fit_on_background_change: false,
            max_follow_up_passes: 4,
        }
    }
}

/// Thick-slab reconstruction of the background and foreground layers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabSettings {
    pub enabled: bool,
    /// Slab thickness (mm) along the slice normal
    pub thickness: f64,
    /// Samples per voxel step along the normal
    pub oversampling: f64,
    pub mode: SlabMode,
}

impl Default for SlabSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            thickness: 1.0,
            oversampling: 1.0,
            mode: SlabMode::Max,
        }
    }
}

impl SlabSettings {
    /// Number of planes sampled across the slab for a volume whose voxels
    /// are `voxel_step` mm apart along the slice normal. Always at least one.
    pub fn slice_count(&self, voxel_step: f64) -> u32 {
        if !self.enabled || !(self.thickness > 0.0) || !(voxel_step > 0.0) {
            return 1;
        }
        let oversampling = if self.oversampling > 0.0 { self.oversampling } else { 1.0 };
        (self.thickness / voxel_step * oversampling).round().max(1.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = EngineConfig::default();
        assert_eq!(config.geometry.rotated_tolerance_degrees, 0.1);
        assert_eq!(config.compositing.mode, CompositingMode::AlphaBlend);
        assert!(!config.pipeline.fit_on_background_change);
    }

    #[test]
    fn slab_slice_count_follows_thickness_and_spacing() {
        let slab = SlabSettings {
            enabled: true,
            thickness: 5.0,
            ..SlabSettings::default()
        };
        assert_eq!(slab.slice_count(1.0), 5);
        assert_eq!(slab.slice_count(2.5), 2);
        assert_eq!(slab.slice_count(20.0), 1);
        assert_eq!(SlabSettings { oversampling: 2.0, ..slab }.slice_count(2.5), 4);
        assert_eq!(SlabSettings { enabled: false, ..slab }.slice_count(1.0), 1);
        assert_eq!(SlabSettings { thickness: f64::NAN, ..slab }.slice_count(1.0), 1);
    }

    #[test]
    fn missing_directory_yields_defaults() {
        let config = EngineConfig::load_from("does/not/exist").unwrap();
        assert_eq!(config.window_level, WindowLevelConfig::default());
    }
}
