//! Renderer configuration.
//!
//! Settings are read from a TOML file and passed explicitly to every component
//! that needs them. No component reads a global quality level.

use crate::error::{Result, VulkanError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Name reported to the Vulkan driver.
    pub application_name: String,
    /// Request the Khronos validation layer. Missing layers only log a warning.
    pub validation: bool,
    /// Number of frame slots (2 or 3).
    pub frames_in_flight: u32,
    /// Preferred presentation mode; falls back to FIFO when unavailable.
    pub present_mode: PresentModePreference,
    /// Location of the persisted pipeline cache blob.
    pub pipeline_cache_path: PathBuf,
    /// Directory that program descriptors and shader paths are resolved against.
    pub shader_root: PathBuf,
    /// Water and wave simulation settings.
    pub water: WaterConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "NovaDE Ocean".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            present_mode: PresentModePreference::Mailbox,
            pipeline_cache_path: PathBuf::from("cache/pipeline_cache.bin"),
            shader_root: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders")),
            water: WaterConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RendererConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No renderer config at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded renderer config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(2..=3).contains(&self.frames_in_flight) {
            return Err(VulkanError::Config(format!(
                "frames_in_flight must be 2 or 3, got {}",
                self.frames_in_flight
            )));
        }
        self.water.validate()
    }
}

/// Presentation mode preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Low-latency triple buffering when available.
    Mailbox,
    /// Strict vsync; always available.
    Fifo,
    /// No vsync; tearing allowed.
    Immediate,
}

/// Water quality tier. Selects the tank layout and the binding schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WaveQuality {
    /// One wave tank, plain 2D wave texture.
    Single = 1,
    /// Three wave tanks composited into a texture array.
    Layered = 2,
    /// Layered waves plus mirror (reflection) inputs.
    Reflective = 3,
}

impl WaveQuality {
    /// Number of independent wave tanks simulated at this tier.
    pub fn tank_count(self) -> usize {
        match self {
            WaveQuality::Single => 1,
            WaveQuality::Layered | WaveQuality::Reflective => 3,
        }
    }

    /// Edge length of each tank's square grid.
    pub fn tank_size(self) -> usize {
        match self {
            WaveQuality::Single => 256,
            WaveQuality::Layered | WaveQuality::Reflective => 128,
        }
    }

    /// Whether the wave texture is an array with one layer per tank.
    pub fn uses_wave_array(self) -> bool {
        self.tank_count() > 1
    }
}

impl TryFrom<u8> for WaveQuality {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(WaveQuality::Single),
            2 => Ok(WaveQuality::Layered),
            3 => Ok(WaveQuality::Reflective),
            other => Err(format!("wave quality must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<WaveQuality> for u8 {
    fn from(quality: WaveQuality) -> Self {
        quality as u8
    }
}

/// Which wave algorithm backs the tanks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveSolver {
    /// Spectral synthesis with an inverse FFT.
    Spectral,
    /// Finite-difference wave equation.
    Relaxation,
}

/// Fog applied to the water surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FogConfig {
    /// Linear RGB fog color.
    pub color: [f32; 3],
    /// Distance where fog starts.
    pub start: f32,
    /// Distance where fog is fully opaque.
    pub end: f32,
}

impl Default for FogConfig {
    fn default() -> Self {
        Self { color: [0.45, 0.55, 0.65], start: 64.0, end: 128.0 }
    }
}

/// Water renderer and wave simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterConfig {
    /// Quality tier (1 to 3).
    pub quality: WaveQuality,
    /// Solver used by every tank.
    pub solver: WaveSolver,
    /// Time-step multiplier per tank; index `i` drives tank `i`.
    pub time_scales: Vec<f32>,
    /// Seed for spectrum phases and relaxation impulses.
    pub seed: u64,
    /// Vertices per edge of the water grid mesh.
    pub mesh_resolution: u32,
    /// Scale applied to the wave displacement in the vertex stage.
    pub displacement_scale: f32,
    /// Fog settings.
    pub fog: FogConfig,
}

impl Default for WaterConfig {
    fn default() -> Self {
        Self {
            quality: WaveQuality::Single,
            solver: WaveSolver::Spectral,
            time_scales: vec![1.0, 0.75, 0.5],
            seed: 0x5eed_0ce4,
            mesh_resolution: 128,
            displacement_scale: 0.25,
            fog: FogConfig::default(),
        }
    }
}

impl WaterConfig {
    /// Time multiplier for tank `index`; tanks beyond the list run at 1.0.
    pub fn time_scale(&self, index: usize) -> f32 {
        self.time_scales.get(index).copied().unwrap_or(1.0)
    }

    fn validate(&self) -> Result<()> {
        if self.mesh_resolution < 2 {
            return Err(VulkanError::Config(format!(
                "water.mesh_resolution must be at least 2, got {}",
                self.mesh_resolution
            )));
        }
        if let Some(scale) = self.time_scales.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(VulkanError::Config(format!(
                "water.time_scales entries must be finite and non-negative, got {scale}"
            )));
        }
        if self.fog.end <= self.fog.start {
            return Err(VulkanError::Config("water.fog.end must be greater than water.fog.start".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.water.quality, WaveQuality::Single);
        assert_eq!(config.water.quality.tank_count(), 1);
    }

    #[test]
    fn parses_partial_toml() {
        let config = RendererConfig::from_toml_str(
            r#"
            frames_in_flight = 3
            present_mode = "fifo"

            [water]
            quality = 2
            solver = "relaxation"
            time_scales = [1.0, 0.5, 0.25]
            "#,
        )
        .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.present_mode, PresentModePreference::Fifo);
        assert_eq!(config.water.quality, WaveQuality::Layered);
        assert_eq!(config.water.solver, WaveSolver::Relaxation);
        assert_eq!(config.water.time_scale(2), 0.25);
        assert_eq!(config.water.time_scale(7), 1.0);
        assert_eq!(config.water.mesh_resolution, 128);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            RendererConfig::from_toml_str("frames_in_flight = 4"),
            Err(VulkanError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_toml_str("[water]\nquality = 4"),
            Err(VulkanError::ConfigParse(_))
        ));
        assert!(matches!(
            RendererConfig::from_toml_str("[water.fog]\nstart = 10.0\nend = 5.0"),
            Err(VulkanError::Config(_))
        ));
    }

    #[test]
    fn load_falls_back_to_defaults_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let config = RendererConfig::load(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("renderer.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "validation = false\n[water]\nquality = 3").unwrap();

        let config = RendererConfig::load(&path).unwrap();
        assert!(!config.validation);
        assert_eq!(config.water.quality, WaveQuality::Reflective);
        assert!(config.water.quality.uses_wave_array());
    }
}
