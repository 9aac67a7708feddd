//! Structural control networks.
//!
//! Each [`ControlNetUnit`] pairs a control model with the preprocessing
//! applied to its control image and a residual scale. [`MultiControlNet`]
//! evaluates every unit and sums the scaled residual stacks.

use ndarray::{Array1, Array3, Array4};

use crate::config::TilerConfig;
use crate::error::{PipelineError, Result};
use crate::types::PixelImage;

use super::encoders::PromptEmbedding;

/// Preprocessing family of a control unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ControlProcessor {
    /// The control image is used as given.
    #[default]
    Passthrough,
    /// Inpainting control: the inpaint mask blacks out pixels and is appended as a latent channel.
    Inpaint,
    /// Any other annotator family (canny, depth, ...).
    Named(String),
}

impl ControlProcessor {
    /// Returns true for inpainting control units.
    pub fn is_inpaint(&self) -> bool {
        matches!(self, ControlProcessor::Inpaint)
    }

    /// Returns the processor name.
    pub fn as_str(&self) -> &str {
        match self {
            ControlProcessor::Passthrough => "none",
            ControlProcessor::Inpaint => "inpaint",
            ControlProcessor::Named(name) => name,
        }
    }
}

/// Turns a raw control image into the signal a control model expects.
pub trait Annotator {
    /// Processes one image.
    fn process(&self, image: &PixelImage) -> Result<PixelImage>;
}

/// Residuals added to the image-token stream after each backbone block.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResiduals {
    /// One residual per joint block, shape `(batch, image_tokens, dim)`.
    pub joint: Vec<Array3<f32>>,
    /// One residual per single block, shape `(batch, image_tokens, dim)`.
    pub single: Vec<Array3<f32>>,
}

impl ControlResiduals {
    fn scaled(mut self, scale: f32) -> Self {
        if scale != 1.0 {
            self.joint.iter_mut().chain(self.single.iter_mut()).for_each(|r| *r *= scale);
        }
        self
    }

    fn accumulate(&mut self, other: ControlResiduals) -> Result<()> {
        if other.joint.len() != self.joint.len() {
            return Err(PipelineError::control_stack_mismatch(
                "joint",
                other.joint.len(),
                self.joint.len(),
            ));
        }
        if other.single.len() != self.single.len() {
            return Err(PipelineError::control_stack_mismatch(
                "single",
                other.single.len(),
                self.single.len(),
            ));
        }
        let pairs = self
            .joint
            .iter_mut()
            .zip(other.joint)
            .chain(self.single.iter_mut().zip(other.single));
        for (acc, r) in pairs {
            if acc.dim() != r.dim() {
                return Err(PipelineError::shape_mismatch(
                    "control residual",
                    r.shape(),
                    acc.shape(),
                ));
            }
            *acc += &r;
        }
        Ok(())
    }
}

/// Shared inputs of one control evaluation, mirroring the backbone call.
#[derive(Debug, Clone, Copy)]
pub struct ControlNetContext<'a> {
    /// Current latents (or the current tile).
    pub latents: &'a Array4<f32>,
    /// Timestep, shape `(batch,)`.
    pub timestep: &'a Array1<f32>,
    /// Prompt embedding of the side being evaluated.
    pub prompt: &'a PromptEmbedding,
    /// Embedded guidance values, shape `(batch,)`.
    pub guidance: &'a Array1<f32>,
    /// Image position ids of `latents`.
    pub image_ids: &'a Array3<f32>,
    /// Tiling settings of the enclosing evaluation.
    pub tiler: TilerConfig,
}

/// A structural control network.
pub trait ControlNet {
    /// Produces residual stacks for one control frame.
    fn forward(
        &self,
        frame: &Array4<f32>,
        processor: &ControlProcessor,
        context: &ControlNetContext<'_>,
    ) -> Result<ControlResiduals>;
}

/// One loaded control model with its preprocessing and scale.
pub struct ControlNetUnit {
    /// Preprocessing family.
    pub processor: ControlProcessor,
    /// Optional annotator applied to the control image.
    pub annotator: Option<Box<dyn Annotator>>,
    /// The control model.
    pub model: Box<dyn ControlNet>,
    /// Residual scale.
    pub scale: f32,
}

impl std::fmt::Debug for ControlNetUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlNetUnit")
            .field("processor", &self.processor)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

impl ControlNetUnit {
    /// Creates a unit without an annotator.
    pub fn new(processor: ControlProcessor, model: Box<dyn ControlNet>, scale: f32) -> Self {
        Self {
            processor,
            annotator: None,
            model,
            scale,
        }
    }

    /// Attaches an annotator.
    pub fn with_annotator(mut self, annotator: Box<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }
}

/// Several control units composed additively.
#[derive(Debug, Default)]
pub struct MultiControlNet {
    units: Vec<ControlNetUnit>,
}

impl MultiControlNet {
    /// Creates a manager over `units`.
    pub fn new(units: Vec<ControlNetUnit>) -> Self {
        Self { units }
    }

    /// Returns the number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if no units are loaded.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Returns the loaded units.
    pub fn units(&self) -> &[ControlNetUnit] {
        &self.units
    }

    /// Runs unit `index`'s annotator on `image`, or returns it unchanged.
    pub fn process_image(&self, image: &PixelImage, index: usize) -> Result<PixelImage> {
        match self.units.get(index).and_then(|u| u.annotator.as_ref()) {
            Some(annotator) => annotator.process(image),
            None => Ok(image.clone()),
        }
    }

    /// Evaluates every unit on its frame and sums the scaled residuals.
    ///
    /// Returns `None` when no units are loaded.
    pub fn forward(
        &self,
        frames: &[Array4<f32>],
        context: &ControlNetContext<'_>,
    ) -> Result<Option<ControlResiduals>> {
        if frames.len() != self.units.len() {
            return Err(PipelineError::invalid_request(format!(
                "{} control frames for {} control units",
                frames.len(),
                self.units.len()
            )));
        }
        let mut total: Option<ControlResiduals> = None;
        for (unit, frame) in self.units.iter().zip(frames) {
            let residuals = unit.model.forward(frame, &unit.processor, context)?.scaled(unit.scale);
            match total.as_mut() {
                Some(acc) => acc.accumulate(residuals)?,
                None => total = Some(residuals),
            }
        }
        Ok(total)
    }
}
