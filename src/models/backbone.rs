//! Diffusion-transformer backbone contract.
//!
//! The backbone exposes its sub-modules individually so the denoising
//! evaluator can interleave control residuals and adapter injections
//! between blocks. Patch packing and image position ids have fixed
//! layouts and are provided here as default implementations.

use ndarray::{s, Array1, Array2, Array3, Array4, Array5, ArrayD};

use crate::error::{PipelineError, Result};

use super::adapter::BlockAdapterKwargs;

/// Side length of one latent patch.
pub const PATCH_SIZE: usize = 2;

/// Regional entity prompts and masks, passed to the backbone unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConditioning {
    /// Entity prompt embeddings, shape `(batch, n_entities, sequence_length, dim)`.
    pub entity_prompt_emb: Array4<f32>,
    /// Entity masks at latent resolution, shape `(batch, n_entities, 1, h, w)`.
    pub entity_masks: Array5<f32>,
}

impl EntityConditioning {
    /// Returns the number of entities.
    pub fn num_entities(&self) -> usize {
        self.entity_masks.dim().1
    }
}

/// Prompt tokens, positional encoding and attention mask built for entity prompting.
#[derive(Debug, Clone)]
pub struct EntityContext {
    /// Embedded prompt tokens (global prompt followed by every entity prompt).
    pub prompt_tokens: Array3<f32>,
    /// Positional encoding for the concatenated prompt and image tokens.
    pub positional: ArrayD<f32>,
    /// Additive attention mask restricting entity tokens to their regions.
    pub attention_mask: Option<Array4<f32>>,
}

/// Per-step inputs shared by every block call.
#[derive(Debug, Clone, Copy)]
pub struct BlockInput<'a> {
    /// Conditioning vector, shape `(batch, dim)`.
    pub conditioning: &'a Array2<f32>,
    /// Positional encoding for `[prompt tokens, image tokens]`.
    pub positional: &'a ArrayD<f32>,
    /// Optional attention mask.
    pub attention_mask: Option<&'a Array4<f32>>,
    /// Adapter injection for this block, if any.
    pub adapter: Option<&'a BlockAdapterKwargs>,
}

/// A diffusion-transformer denoiser.
pub trait Backbone {
    /// Number of joint (two-stream) blocks.
    fn num_joint_blocks(&self) -> usize;

    /// Number of single-stream blocks.
    fn num_single_blocks(&self) -> usize;

    /// Whether the model was distilled with a guidance embedder.
    fn has_guidance_embedder(&self) -> bool;

    /// Embeds the timestep, shape `(batch,)` to `(batch, dim)`.
    fn time_embed(&self, timestep: &Array1<f32>) -> Result<Array2<f32>>;

    /// Embeds the pooled prompt, shape `(batch, pooled_dim)` to `(batch, dim)`.
    fn pooled_text_embed(&self, pooled: &Array2<f32>) -> Result<Array2<f32>>;

    /// Embeds the (already scaled) guidance value, shape `(batch,)` to `(batch, dim)`.
    fn guidance_embed(&self, guidance: &Array1<f32>) -> Result<Array2<f32>>;

    /// Projects packed latent patches into the token space.
    fn embed_image(&self, patches: &Array3<f32>) -> Result<Array3<f32>>;

    /// Projects prompt embeddings into the token space.
    fn embed_context(&self, prompt_emb: &Array3<f32>) -> Result<Array3<f32>>;

    /// Builds the positional encoding from concatenated text and image ids.
    fn positional_encoding(&self, ids: &Array3<f32>) -> Result<ArrayD<f32>>;

    /// Builds prompt tokens, positional encoding and attention mask for entity prompting.
    fn process_entity_masks(
        &self,
        image_tokens: &Array3<f32>,
        prompt_emb: &Array3<f32>,
        entity: &EntityConditioning,
        text_ids: &Array3<f32>,
        image_ids: &Array3<f32>,
    ) -> Result<EntityContext>;

    /// Runs joint block `index`, returning updated `(image_tokens, prompt_tokens)`.
    fn joint_block(
        &self,
        index: usize,
        image_tokens: Array3<f32>,
        prompt_tokens: Array3<f32>,
        input: &BlockInput<'_>,
    ) -> Result<(Array3<f32>, Array3<f32>)>;

    /// Runs single block `index` on `[prompt tokens, image tokens]`.
    ///
    /// `prompt_tokens` carries the prompt span length; the returned pair is
    /// `(hidden_states, prompt_tokens)`.
    fn single_block(
        &self,
        index: usize,
        hidden_states: Array3<f32>,
        prompt_tokens: Array3<f32>,
        input: &BlockInput<'_>,
    ) -> Result<(Array3<f32>, Array3<f32>)>;

    /// Final adaptive normalisation.
    fn final_norm_out(
        &self,
        tokens: &Array3<f32>,
        conditioning: &Array2<f32>,
    ) -> Result<Array3<f32>>;

    /// Final projection back to packed patch space.
    fn final_proj_out(&self, tokens: &Array3<f32>) -> Result<Array3<f32>>;

    /// Packs latents into 2x2 patches.
    fn patchify(&self, latents: &Array4<f32>) -> Result<Array3<f32>> {
        patchify(latents)
    }

    /// Unpacks 2x2 patches into latents of `height`×`width`.
    fn unpatchify(&self, tokens: &Array3<f32>, height: usize, width: usize) -> Result<Array4<f32>> {
        unpatchify(tokens, height, width)
    }

    /// Image position ids for a latent grid.
    fn prepare_image_ids(&self, latents: &Array4<f32>) -> Array3<f32> {
        prepare_image_ids(latents)
    }
}

/// Packs `(B, C, H, W)` latents into `(B, H/2 * W/2, C * 4)` tokens.
///
/// Token features are ordered channel-major, then patch row, then patch column.
pub fn patchify(latents: &Array4<f32>) -> Result<Array3<f32>> {
    let (batch, channels, height, width) = latents.dim();
    if height % PATCH_SIZE != 0 || width % PATCH_SIZE != 0 {
        return Err(PipelineError::shape_mismatch(
            "latent grid must be divisible by the patch size",
            latents.shape(),
            &[batch, channels, height - height % PATCH_SIZE, width - width % PATCH_SIZE],
        ));
    }
    let (ph, pw) = (height / PATCH_SIZE, width / PATCH_SIZE);
    let features = channels * PATCH_SIZE * PATCH_SIZE;
    Ok(Array3::from_shape_fn((batch, ph * pw, features), |(b, t, f)| {
        let (row, col) = (t / pw, t % pw);
        let c = f / (PATCH_SIZE * PATCH_SIZE);
        let p = (f / PATCH_SIZE) % PATCH_SIZE;
        let q = f % PATCH_SIZE;
        latents[[b, c, row * PATCH_SIZE + p, col * PATCH_SIZE + q]]
    }))
}

/// Inverse of [`patchify`].
pub fn unpatchify(tokens: &Array3<f32>, height: usize, width: usize) -> Result<Array4<f32>> {
    let (batch, num_tokens, features) = tokens.dim();
    let (ph, pw) = (height / PATCH_SIZE, width / PATCH_SIZE);
    let patch_area = PATCH_SIZE * PATCH_SIZE;
    if num_tokens != ph * pw
        || features % patch_area != 0
        || height % PATCH_SIZE != 0
        || width % PATCH_SIZE != 0
    {
        return Err(PipelineError::shape_mismatch(
            "patch tokens",
            tokens.shape(),
            &[batch, ph * pw, features - features % patch_area],
        ));
    }
    let channels = features / patch_area;
    Ok(Array4::from_shape_fn((batch, channels, height, width), |(b, c, y, x)| {
        let t = (y / PATCH_SIZE) * pw + x / PATCH_SIZE;
        let f = c * patch_area + (y % PATCH_SIZE) * PATCH_SIZE + x % PATCH_SIZE;
        tokens[[b, t, f]]
    }))
}

/// Position ids `[0, patch_row, patch_col]` for every patch, shape `(B, H/2 * W/2, 3)`.
pub fn prepare_image_ids(latents: &Array4<f32>) -> Array3<f32> {
    let (batch, _, height, width) = latents.dim();
    let (ph, pw) = (height / PATCH_SIZE, width / PATCH_SIZE);
    Array3::from_shape_fn((batch, ph * pw, 3), |(_, t, axis)| match axis {
        1 => (t / pw) as f32,
        2 => (t % pw) as f32,
        _ => 0.0,
    })
}

/// Concatenates text and image ids along the token axis.
pub fn concat_ids(text_ids: &Array3<f32>, image_ids: &Array3<f32>) -> Result<Array3<f32>> {
    ndarray::concatenate(ndarray::Axis(1), &[text_ids.view(), image_ids.view()])
        .map_err(|e| {
            PipelineError::with_source(
                crate::error::ErrorCode::ShapeMismatch,
                "Failed to concatenate position ids",
                e,
            )
        })
}

/// Returns the image-token span of `[prompt tokens, image tokens]`.
pub fn image_span(hidden_states: &Array3<f32>, prompt_len: usize) -> ndarray::ArrayView3<'_, f32> {
    hidden_states.slice(s![.., prompt_len.., ..])
}
