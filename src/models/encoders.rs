//! Text and latent encoder contracts.
//!
//! The pipeline never looks inside these networks; it only relies on the
//! shapes documented on each method.

use ndarray::{Array2, Array3, Array4};

use crate::config::TilerConfig;
use crate::error::Result;
use crate::types::PixelImage;

/// Encoded prompt consumed by the backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEmbedding {
    /// Token embeddings, shape `(batch, sequence_length, dim)`.
    pub prompt_emb: Array3<f32>,
    /// Pooled embedding, shape `(batch, pooled_dim)`.
    pub pooled_prompt_emb: Array2<f32>,
    /// Text position ids, shape `(batch, sequence_length, 3)`.
    pub text_ids: Array3<f32>,
}

/// Text encoder stack (CLIP pooled + T5 sequence in the reference model).
///
/// Output must be deterministic and padded to `sequence_length`, so that
/// prompts encoded separately can be stacked.
pub trait TextEncoder {
    /// Encodes one prompt.
    fn encode(&self, prompt: &str, sequence_length: usize) -> Result<PromptEmbedding>;
}

/// Rewrites a positive prompt before it is encoded.
pub trait PromptRefiner {
    /// Returns the refined prompt.
    fn refine(&self, prompt: &str) -> Result<String>;
}

/// Pixel to latent encoder (8x spatial downscale, 16 channels).
pub trait LatentEncoder {
    /// Encodes `(batch, 3, H, W)` pixels into `(batch, 16, H/8, W/8)` latents.
    fn encode(&self, image: &PixelImage, tiler: &TilerConfig) -> Result<Array4<f32>>;
}

/// Latent to pixel decoder.
pub trait LatentDecoder {
    /// Decodes `(batch, 16, h, w)` latents into `(batch, 3, 8h, 8w)` pixels in `[-1, 1]`.
    fn decode(&self, latents: &Array4<f32>, tiler: &TilerConfig) -> Result<PixelImage>;
}
