//! Pipeline configuration module.
//!
//! Contains the defaults used when a generation request leaves a value
//! unset: scheduler shape, step count, guidance, text length and tiling.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Spatial downscale factor between pixel space and latent space.
pub const VAE_SCALE_FACTOR: usize = 8;

/// Number of channels in the latent representation.
pub const LATENT_CHANNELS: usize = 16;

/// Output height and width are rounded to a multiple of this value.
pub const SIZE_DIVISOR: usize = 16;

/// Flow matching scheduler parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of timesteps the backbone was trained with.
    pub num_train_timesteps: f32,
    /// Sigma shift: `shift * s / (1 + (shift - 1) * s)`.
    pub shift: f32,
    /// Sigma at full denoising strength.
    pub sigma_max: f32,
    /// Sigma at the last schedule level.
    pub sigma_min: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000.0,
            shift: 3.0,
            sigma_max: 1.0,
            sigma_min: 0.003 / 1.002,
        }
    }
}

/// Tiled evaluation parameters, in latent cells.
///
/// The same settings are forwarded to the latent encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilerConfig {
    /// Whether tiled evaluation is enabled.
    pub tiled: bool,
    /// Edge length of one square tile.
    pub tile_size: usize,
    /// Distance between the origins of neighbouring tiles.
    pub tile_stride: usize,
}

impl TilerConfig {
    /// Returns a copy with tiling switched off.
    pub fn untiled(self) -> Self {
        Self {
            tiled: false,
            ..self
        }
    }

    /// Checks tile geometry against the 2x2 patch grid.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.tile_stride == 0 {
            return Err(PipelineError::invalid_config("tile size and stride must be > 0"));
        }
        if self.tile_stride > self.tile_size {
            return Err(PipelineError::invalid_config(format!(
                "tile_stride {} exceeds tile_size {}",
                self.tile_stride, self.tile_size
            )));
        }
        if self.tile_size % 2 != 0 || self.tile_stride % 2 != 0 {
            return Err(PipelineError::invalid_config(
                "tile size and stride must be even to align with 2x2 patches",
            ));
        }
        Ok(())
    }
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            tiled: false,
            tile_size: 128,
            tile_stride: 64,
        }
    }
}

/// Runtime configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scheduler shape.
    pub scheduler: SchedulerConfig,
    /// Default number of denoising steps.
    pub inference_steps: u32,
    /// Default guidance value fed to the backbone's guidance embedder.
    pub embedded_guidance: f32,
    /// Token length used for prompt encoding.
    pub t5_sequence_length: usize,
    /// Default output height in pixels.
    pub height: usize,
    /// Default output width in pixels.
    pub width: usize,
    /// Default tiling behaviour.
    pub tiler: TilerConfig,
    /// Side length reference images are resized to before the image encoder.
    pub ipadapter_image_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            inference_steps: 30,
            embedded_guidance: 3.5,
            t5_sequence_length: 512,
            height: 1024,
            width: 1024,
            tiler: TilerConfig::default(),
            ipadapter_image_size: 384,
        }
    }
}

impl PipelineConfig {
    /// Creates a new PipelineConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a PipelineConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `FLUX_STEPS` - Default number of inference steps (1-1000)
    /// - `FLUX_GUIDANCE` - Default embedded guidance
    /// - `FLUX_T5_LENGTH` - Prompt token length
    /// - `FLUX_TILE_SIZE` - Tile edge length in latent cells
    /// - `FLUX_TILE_STRIDE` - Tile stride in latent cells
    /// - `FLUX_SHIFT` - Scheduler sigma shift
    ///
    /// Falls back to defaults for unset or unparsable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(steps_str) = std::env::var("FLUX_STEPS") {
            if let Ok(steps) = steps_str.parse::<u32>() {
                if steps > 0 && steps <= 1000 {
                    config.inference_steps = steps;
                }
            }
        }

        if let Ok(guidance_str) = std::env::var("FLUX_GUIDANCE") {
            if let Ok(guidance) = guidance_str.parse::<f32>() {
                if guidance.is_finite() && guidance >= 0.0 {
                    config.embedded_guidance = guidance;
                }
            }
        }

        if let Ok(length_str) = std::env::var("FLUX_T5_LENGTH") {
            if let Ok(length) = length_str.parse::<usize>() {
                if length > 0 {
                    config.t5_sequence_length = length;
                }
            }
        }

        if let Ok(size_str) = std::env::var("FLUX_TILE_SIZE") {
            if let Ok(size) = size_str.parse::<usize>() {
                if size > 0 {
                    config.tiler.tile_size = size;
                }
            }
        }

        if let Ok(stride_str) = std::env::var("FLUX_TILE_STRIDE") {
            if let Ok(stride) = stride_str.parse::<usize>() {
                if stride > 0 {
                    config.tiler.tile_stride = stride;
                }
            }
        }

        if let Ok(shift_str) = std::env::var("FLUX_SHIFT") {
            if let Ok(shift) = shift_str.parse::<f32>() {
                if shift.is_finite() && shift > 0.0 {
                    config.scheduler.shift = shift;
                }
            }
        }

        config
    }

    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::with_source(
                crate::error::ErrorCode::InvalidConfig,
                format!("Failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            PipelineError::with_source(
                crate::error::ErrorCode::InvalidConfig,
                format!("Failed to parse config file {}", path.display()),
                e,
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.inference_steps == 0 {
            return Err(PipelineError::invalid_config("inference_steps must be > 0"));
        }
        self.tiler.validate()?;
        let s = &self.scheduler;
        if !(s.sigma_min >= 0.0 && s.sigma_min < s.sigma_max && s.sigma_max <= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "sigma range [{}, {}] must satisfy 0 <= min < max <= 1",
                s.sigma_min, s.sigma_max
            )));
        }
        if s.shift <= 0.0 || s.num_train_timesteps <= 0.0 {
            return Err(PipelineError::invalid_config(
                "shift and num_train_timesteps must be positive",
            ));
        }
        if self.t5_sequence_length == 0 || self.ipadapter_image_size == 0 {
            return Err(PipelineError::invalid_config(
                "t5_sequence_length and ipadapter_image_size must be > 0",
            ));
        }
        Ok(())
    }
}

/// Rounds a pixel dimension to the nearest multiple of [`SIZE_DIVISOR`].
///
/// Ties round up; the result is never smaller than one divisor.
pub fn round_to_divisor(value: usize) -> usize {
    let rounded = (value + SIZE_DIVISOR / 2) / SIZE_DIVISOR * SIZE_DIVISOR;
    rounded.max(SIZE_DIVISOR)
}
