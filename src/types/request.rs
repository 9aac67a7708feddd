//! GenerationRequest type describing one pipeline call.
//!
//! Optional feature groups (local prompts, control images, reference
//! images, entity prompts) are absent by default; an absent group turns
//! the matching conditioning path into a no-op rather than an error.

use crate::config::TilerConfig;
use crate::error::{PipelineError, Result};

use super::image::{Mask, PixelImage};

/// A prompt that overrides the global prediction inside a mask.
#[derive(Debug, Clone)]
pub struct LocalPrompt {
    /// Prompt text for the region.
    pub prompt: String,
    /// Region mask at output resolution.
    pub mask: Mask,
    /// Weight of this region where regions overlap.
    pub scale: f32,
}

/// A prompt bound to a region through attention masking.
#[derive(Debug, Clone)]
pub struct EntityPrompt {
    /// Prompt text for the entity.
    pub prompt: String,
    /// Entity mask at output resolution.
    pub mask: Mask,
}

/// Structural control inputs.
#[derive(Debug, Clone)]
pub struct ControlNetInput {
    /// One image shared by every control unit, or one image per unit.
    pub images: Vec<PixelImage>,
    /// Mask applied to inpaint control units.
    pub inpaint_mask: Option<Mask>,
    /// Whether the negative side also receives the control signal.
    pub enable_on_negative: bool,
}

/// Reference-image adapter inputs.
#[derive(Debug, Clone)]
pub struct IpAdapterInput {
    /// Reference images.
    pub images: Vec<PixelImage>,
    /// Strength of the injected adapter signal.
    pub scale: f32,
}

/// Entity-level regional prompting inputs.
#[derive(Debug, Clone)]
pub struct EligenInput {
    /// Entity prompts with their masks.
    pub entities: Vec<EntityPrompt>,
    /// Whether the negative side is entity-masked as well.
    pub enable_on_negative: bool,
    /// Whether the entity union is treated as an inpainting region.
    pub enable_inpaint: bool,
    /// Weight of the predicted noise outside the inpainting region.
    pub background_weight: f32,
}

/// A single image generation call.
///
/// Fields left as `None` fall back to [`PipelineConfig`](crate::config::PipelineConfig).
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Text description of the image.
    pub prompt: String,
    /// Negative prompt; only encoded when `cfg_scale != 1.0`.
    pub negative_prompt: String,
    /// Classifier-free guidance scale.
    pub cfg_scale: f32,
    /// Value fed to the backbone's guidance embedder.
    pub embedded_guidance: Option<f32>,
    /// Prompt token length.
    pub t5_sequence_length: Option<usize>,
    /// Image to edit; `None` starts from pure noise.
    pub input_image: Option<PixelImage>,
    /// Fraction of the schedule applied to `input_image`, in `(0, 1]`.
    pub denoising_strength: f32,
    /// Output height in pixels (rounded to a multiple of 16).
    pub height: Option<usize>,
    /// Output width in pixels (rounded to a multiple of 16).
    pub width: Option<usize>,
    /// Noise seed; `None` draws a random seed.
    pub seed: Option<u64>,
    /// Number of denoising steps.
    pub inference_steps: Option<u32>,
    /// Region prompts with masks and scales.
    pub local_prompts: Vec<LocalPrompt>,
    /// Structural control inputs.
    pub controlnet: Option<ControlNetInput>,
    /// Reference-image adapter inputs.
    pub ipadapter: Option<IpAdapterInput>,
    /// Entity prompts.
    pub eligen: Option<EligenInput>,
    /// Tiling override.
    pub tiler: Option<TilerConfig>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            cfg_scale: 1.0,
            embedded_guidance: None,
            t5_sequence_length: None,
            input_image: None,
            denoising_strength: 1.0,
            height: None,
            width: None,
            seed: None,
            inference_steps: None,
            local_prompts: Vec::new(),
            controlnet: None,
            ipadapter: None,
            eligen: None,
            tiler: None,
        }
    }
}

impl GenerationRequest {
    /// Creates a request for `prompt` with every other field at its default.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets the negative prompt and guidance scale.
    pub fn with_negative(mut self, negative_prompt: impl Into<String>, cfg_scale: f32) -> Self {
        self.negative_prompt = negative_prompt.into();
        self.cfg_scale = cfg_scale;
        self
    }

    /// Sets the output size in pixels.
    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    /// Sets the noise seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the number of denoising steps.
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.inference_steps = Some(steps);
        self
    }

    /// Starts from `image` instead of pure noise.
    pub fn with_input_image(mut self, image: PixelImage, denoising_strength: f32) -> Self {
        self.input_image = Some(image);
        self.denoising_strength = denoising_strength;
        self
    }

    /// Adds a region prompt.
    pub fn with_local_prompt(mut self, prompt: impl Into<String>, mask: Mask, scale: f32) -> Self {
        self.local_prompts.push(LocalPrompt {
            prompt: prompt.into(),
            mask,
            scale,
        });
        self
    }

    /// Sets the structural control inputs.
    pub fn with_controlnet(mut self, input: ControlNetInput) -> Self {
        self.controlnet = Some(input);
        self
    }

    /// Sets the reference-image adapter inputs.
    pub fn with_ipadapter(mut self, images: Vec<PixelImage>, scale: f32) -> Self {
        self.ipadapter = Some(IpAdapterInput { images, scale });
        self
    }

    /// Sets the entity prompts.
    pub fn with_eligen(mut self, input: EligenInput) -> Self {
        self.eligen = Some(input);
        self
    }

    /// Overrides the tiling configuration.
    pub fn with_tiler(mut self, tiler: TilerConfig) -> Self {
        self.tiler = Some(tiler);
        self
    }

    /// Validates values that do not depend on the loaded models.
    pub fn validate(&self) -> Result<()> {
        if !self.cfg_scale.is_finite() {
            return Err(PipelineError::invalid_request("cfg_scale must be finite"));
        }
        if !(self.denoising_strength > 0.0 && self.denoising_strength <= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "denoising_strength {} must be in (0, 1]",
                self.denoising_strength
            )));
        }
        if self.inference_steps == Some(0) {
            return Err(PipelineError::invalid_config("inference_steps must be > 0"));
        }
        if let Some(local) = self
            .local_prompts
            .iter()
            .find(|l| !(l.scale.is_finite() && l.scale >= 0.0))
        {
            return Err(PipelineError::invalid_request(format!(
                "local prompt \"{}\" has invalid scale {}",
                local.prompt, local.scale
            )));
        }
        if let Some(tiler) = &self.tiler {
            tiler.validate()?;
        }
        if let Some(controlnet) = &self.controlnet {
            if controlnet.images.is_empty() {
                return Err(PipelineError::invalid_request("control input has no images"));
            }
        }
        if let Some(ipadapter) = &self.ipadapter {
            if ipadapter.images.is_empty() {
                return Err(PipelineError::invalid_request("adapter input has no images"));
            }
        }
        if let Some(eligen) = &self.eligen {
            if eligen.entities.is_empty() {
                return Err(PipelineError::invalid_request("entity input has no entities"));
            }
            if eligen.enable_inpaint && self.input_image.is_none() {
                return Err(PipelineError::invalid_request(
                    "entity inpainting requires an input image",
                ));
            }
            if !(eligen.background_weight.is_finite() && eligen.background_weight >= 0.0) {
                return Err(PipelineError::invalid_request("background_weight must be >= 0"));
            }
        }
        Ok(())
    }
}
