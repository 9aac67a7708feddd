//! Single noise prediction through the backbone.
//!
//! One evaluation runs control models, assembles the conditioning vector,
//! embeds prompt and image tokens and drives every backbone block, adding
//! control residuals and adapter injections between blocks.

use ndarray::{concatenate, s, Array, Array1, Array4, Axis, Dimension};
use tracing::debug;

use crate::config::TilerConfig;
use crate::error::{PipelineError, Result};
use crate::models::backbone::{concat_ids, image_span};
use crate::models::{
    Backbone, BlockInput, ControlNetContext, ControlResiduals, EntityConditioning, MultiControlNet,
};

use super::conditioning::ConditioningBundle;
use super::tiler::{TileContext, TileEvaluator, TileWorker};

/// Predicts the flow for a latent under one conditioning bundle.
pub struct DenoisingEvaluator<'a> {
    dit: &'a dyn Backbone,
    controlnet: Option<&'a MultiControlNet>,
}

impl<'a> DenoisingEvaluator<'a> {
    /// Creates an evaluator; control is skipped when `controlnet` is `None` or empty.
    pub fn new(dit: &'a dyn Backbone, controlnet: Option<&'a MultiControlNet>) -> Self {
        Self { dit, controlnet }
    }

    /// Evaluates the backbone on `latents` at `timestep`.
    ///
    /// With tiling enabled and a latent larger than one tile, every tile is
    /// evaluated on its own (with image ids recomputed and control frames
    /// and entity masks sliced to the tile) and the results are blended.
    pub fn evaluate(
        &self,
        latents: &Array4<f32>,
        timestep: f32,
        bundle: &ConditioningBundle<'_>,
        tiler: &TilerConfig,
    ) -> Result<Array4<f32>> {
        let (_, _, height, width) = latents.dim();
        check_spatial_inputs(bundle, height, width)?;

        if tiler.tiled {
            let worker = TileWorker::new(tiler.tile_size, tiler.tile_stride)?;
            if worker.needs_tiling(height, width) {
                let mut tiles = TiledDenoise {
                    evaluator: self,
                    latents,
                    timestep,
                    bundle,
                    tiler: tiler.untiled(),
                };
                return worker.tiled_forward(height, width, &mut tiles);
            }
        }
        self.forward(latents, timestep, bundle, &tiler.untiled())
    }

    fn forward(
        &self,
        latents: &Array4<f32>,
        timestep: f32,
        bundle: &ConditioningBundle<'_>,
        tiler: &TilerConfig,
    ) -> Result<Array4<f32>> {
        let dit = self.dit;
        let (batch, _, height, width) = latents.dim();
        let timestep = Array1::from_elem(batch, timestep);
        let prompt = bundle.prompt;

        let computed_ids;
        let image_ids = match bundle.image_ids {
            Some(ids) => ids,
            None => {
                computed_ids = dit.prepare_image_ids(latents);
                &computed_ids
            }
        };

        let residuals = match (self.controlnet, bundle.controlnet_frames) {
            (Some(controlnet), Some(frames)) if !controlnet.is_empty() => {
                let context = ControlNetContext {
                    latents,
                    timestep: &timestep,
                    prompt,
                    guidance: bundle.guidance,
                    image_ids,
                    tiler: *tiler,
                };
                controlnet.forward(frames, &context)?
            }
            _ => None,
        };
        let num_joint = dit.num_joint_blocks();
        let num_single = dit.num_single_blocks();
        if let Some(r) = &residuals {
            check_residual_stacks(r, num_joint, num_single)?;
        }

        let mut conditioning = dit.time_embed(&timestep)?;
        let pooled = dit.pooled_text_embed(&prompt.pooled_prompt_emb)?;
        accumulate(&mut conditioning, &pooled, "pooled text embedding")?;
        if dit.has_guidance_embedder() {
            let guidance = bundle.guidance * 1000.0;
            accumulate(&mut conditioning, &dit.guidance_embed(&guidance)?, "guidance embedding")?;
        }

        let mut image_tokens = dit.embed_image(&dit.patchify(latents)?)?;

        let (mut prompt_tokens, positional, attention_mask) = match bundle.entity {
            Some(entity) => {
                let context = dit.process_entity_masks(
                    &image_tokens,
                    &prompt.prompt_emb,
                    entity,
                    &prompt.text_ids,
                    image_ids,
                )?;
                (context.prompt_tokens, context.positional, context.attention_mask)
            }
            None => {
                let prompt_tokens = dit.embed_context(&prompt.prompt_emb)?;
                let ids = concat_ids(&prompt.text_ids, image_ids)?;
                let positional = dit.positional_encoding(&ids)?;
                (prompt_tokens, positional, None)
            }
        };

        for index in 0..num_joint {
            let input = BlockInput {
                conditioning: &conditioning,
                positional: &positional,
                attention_mask: attention_mask.as_ref(),
                adapter: bundle.adapter.get(&index),
            };
            let (image, prompt) = dit.joint_block(index, image_tokens, prompt_tokens, &input)?;
            image_tokens = image;
            prompt_tokens = prompt;
            if let Some(r) = &residuals {
                accumulate(&mut image_tokens, &r.joint[index], "joint control residual")?;
            }
        }

        let prompt_len = prompt_tokens.dim().1;
        let mut hidden_states = concatenate(Axis(1), &[prompt_tokens.view(), image_tokens.view()])?;
        for index in 0..num_single {
            let input = BlockInput {
                conditioning: &conditioning,
                positional: &positional,
                attention_mask: attention_mask.as_ref(),
                adapter: bundle.adapter.get(&(index + num_joint)),
            };
            let (hidden, prompt) = dit.single_block(index, hidden_states, prompt_tokens, &input)?;
            hidden_states = hidden;
            prompt_tokens = prompt;
            if let Some(r) = &residuals {
                let residual = &r.single[index];
                let mut span = hidden_states.slice_mut(s![.., prompt_len.., ..]);
                if span.shape() != residual.shape() {
                    return Err(PipelineError::shape_mismatch(
                        "single control residual",
                        residual.shape(),
                        span.shape(),
                    ));
                }
                span += residual;
            }
        }

        let image_tokens = image_span(&hidden_states, prompt_len).to_owned();
        let output = dit.final_proj_out(&dit.final_norm_out(&image_tokens, &conditioning)?)?;
        dit.unpatchify(&output, height, width)
    }
}

/// Evaluates one tile with tiling disabled.
struct TiledDenoise<'e, 'a> {
    evaluator: &'e DenoisingEvaluator<'a>,
    latents: &'e Array4<f32>,
    timestep: f32,
    bundle: &'e ConditioningBundle<'e>,
    tiler: TilerConfig,
}

impl TileEvaluator for TiledDenoise<'_, '_> {
    fn evaluate_tile(&mut self, tile: &TileContext) -> Result<Array4<f32>> {
        let b = tile.bounds;
        debug!(
            tile = tile.index,
            rows = ?(b.h_start, b.h_end),
            cols = ?(b.w_start, b.w_end),
            "Evaluating tile"
        );

        let latents = self
            .latents
            .slice(s![.., .., b.h_start..b.h_end, b.w_start..b.w_end])
            .to_owned();
        let frames: Option<Vec<Array4<f32>>> = self.bundle.controlnet_frames.map(|frames| {
            frames
                .iter()
                .map(|f| f.slice(s![.., .., b.h_start..b.h_end, b.w_start..b.w_end]).to_owned())
                .collect()
        });
        let entity = self.bundle.entity.map(|e| EntityConditioning {
            entity_prompt_emb: e.entity_prompt_emb.clone(),
            entity_masks: e
                .entity_masks
                .slice(s![.., .., .., b.h_start..b.h_end, b.w_start..b.w_end])
                .to_owned(),
        });

        let bundle = ConditioningBundle {
            image_ids: None,
            controlnet_frames: frames.as_deref(),
            entity: entity.as_ref(),
            ..*self.bundle
        };
        self.evaluator.forward(&latents, self.timestep, &bundle, &self.tiler)
    }
}

fn check_spatial_inputs(
    bundle: &ConditioningBundle<'_>,
    height: usize,
    width: usize,
) -> Result<()> {
    for frame in bundle.controlnet_frames.unwrap_or_default() {
        let (batch, channels, h, w) = frame.dim();
        if (h, w) != (height, width) {
            return Err(PipelineError::shape_mismatch(
                "control frame",
                frame.shape(),
                &[batch, channels, height, width],
            ));
        }
    }
    if let Some(entity) = bundle.entity {
        let (_, _, _, h, w) = entity.entity_masks.dim();
        if (h, w) != (height, width) {
            return Err(PipelineError::mask_mismatch((h, w), (height, width)));
        }
    }
    Ok(())
}

fn check_residual_stacks(
    residuals: &ControlResiduals,
    num_joint: usize,
    num_single: usize,
) -> Result<()> {
    if residuals.joint.len() != num_joint {
        return Err(PipelineError::control_stack_mismatch(
            "joint",
            residuals.joint.len(),
            num_joint,
        ));
    }
    if residuals.single.len() != num_single {
        return Err(PipelineError::control_stack_mismatch(
            "single",
            residuals.single.len(),
            num_single,
        ));
    }
    Ok(())
}

fn accumulate<D: Dimension>(
    acc: &mut Array<f32, D>,
    other: &Array<f32, D>,
    what: &str,
) -> Result<()> {
    if acc.shape() != other.shape() {
        return Err(PipelineError::shape_mismatch(what, other.shape(), acc.shape()));
    }
    *acc += other;
    Ok(())
}
