//! Conditioning assembly.
//!
//! Everything here runs once per call, before the step loop. The results
//! are borrowed by [`ConditioningBundle`]s, one per evaluated side.

use ndarray::{concatenate, Array1, Array2, Array3, Array4, Array5, Axis};
use tracing::debug;

use crate::config::TilerConfig;
use crate::error::{PipelineError, Result};
use crate::models::{
    AdapterInjections, Backbone, EntityConditioning, ImageEncoder, IpAdapter, LatentEncoder,
    MultiControlNet, PromptEmbedding,
};
use crate::types::{GenerationRequest, Mask, PixelImage};

/// Position ids and guidance shared by every side of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraInput {
    /// Image position ids of the full latent grid.
    pub image_ids: Array3<f32>,
    /// Embedded guidance, one value per batch entry.
    pub guidance: Array1<f32>,
}

/// Builds image ids for `latents` and a guidance vector of `guidance`.
pub fn prepare_extra_input(dit: &dyn Backbone, latents: &Array4<f32>, guidance: f32) -> ExtraInput {
    ExtraInput {
        image_ids: dit.prepare_image_ids(latents),
        guidance: Array1::from_elem(latents.dim().0, guidance),
    }
}

/// Conditioning for one evaluation of the denoiser.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningBundle<'a> {
    /// Prompt embedding of this side.
    pub prompt: &'a PromptEmbedding,
    /// Image ids; `None` recomputes them from the evaluated latents.
    pub image_ids: Option<&'a Array3<f32>>,
    /// Embedded guidance.
    pub guidance: &'a Array1<f32>,
    /// One latent-space frame per control unit.
    pub controlnet_frames: Option<&'a [Array4<f32>]>,
    /// Entity prompts and masks.
    pub entity: Option<&'a EntityConditioning>,
    /// Adapter injections keyed by block.
    pub adapter: &'a AdapterInjections,
}

impl<'a> ConditioningBundle<'a> {
    /// Creates a bundle without control frames or entities.
    pub fn new(
        prompt: &'a PromptEmbedding,
        extra: &'a ExtraInput,
        adapter: &'a AdapterInjections,
    ) -> Self {
        Self {
            prompt,
            image_ids: Some(&extra.image_ids),
            guidance: &extra.guidance,
            controlnet_frames: None,
            entity: None,
            adapter,
        }
    }

    /// Sets the control frames.
    pub fn with_controlnet_frames(mut self, frames: Option<&'a [Array4<f32>]>) -> Self {
        self.controlnet_frames = frames;
        self
    }

    /// Sets the entity conditioning.
    pub fn with_entity(mut self, entity: Option<&'a EntityConditioning>) -> Self {
        self.entity = entity;
        self
    }
}

/// Fails if any mask of `request` has a different aspect ratio than the output.
pub fn check_mask_aspects(request: &GenerationRequest, height: usize, width: usize) -> Result<()> {
    for local in &request.local_prompts {
        local.mask.check_aspect(height, width)?;
    }
    if let Some(eligen) = &request.eligen {
        for entity in &eligen.entities {
            entity.mask.check_aspect(height, width)?;
        }
    }
    if let Some(mask) = request.controlnet.as_ref().and_then(|c| c.inpaint_mask.as_ref()) {
        mask.check_aspect(height, width)?;
    }
    Ok(())
}

/// Binary region masks at latent resolution.
pub fn prepare_local_masks<'m>(
    masks: impl IntoIterator<Item = &'m Mask>,
    height: usize,
    width: usize,
) -> Vec<Array2<f32>> {
    masks
        .into_iter()
        .map(|m| m.binarize(height, width).mapv(|inside| if inside { 1.0 } else { 0.0 }))
        .collect()
}

/// Entity conditioning for both sides plus the inpainting foreground.
#[derive(Debug, Clone)]
pub struct EntityInputs {
    /// Positive side.
    pub positive: EntityConditioning,
    /// Negative side, when entity masking is enabled there.
    pub negative: Option<EntityConditioning>,
    /// Union of the entity masks at latent resolution, when inpainting.
    pub foreground: Option<Array2<bool>>,
}

/// Stacks binarised entity masks to `(1, n, 1, height, width)`.
pub fn prepare_entity_masks(masks: &[&Mask], height: usize, width: usize) -> Array5<f32> {
    let binary: Vec<Array2<bool>> = masks.iter().map(|m| m.binarize(height, width)).collect();
    Array5::from_shape_fn((1, binary.len(), 1, height, width), |(_, n, _, y, x)| {
        if binary[n][[y, x]] {
            1.0
        } else {
            0.0
        }
    })
}

/// Builds entity conditioning from encoded entity prompts.
///
/// `entity_prompt_emb` is `(1, n, sequence_length, dim)`. The negative side
/// repeats `negative` once per entity and reuses the positive masks.
pub fn prepare_entity_inputs(
    entity_prompt_emb: Array4<f32>,
    masks: &[&Mask],
    negative: Option<&PromptEmbedding>,
    enable_inpaint: bool,
    height: usize,
    width: usize,
) -> Result<EntityInputs> {
    let entity_masks = prepare_entity_masks(masks, height, width);
    if entity_prompt_emb.dim().1 != entity_masks.dim().1 {
        return Err(PipelineError::invalid_request(format!(
            "{} entity prompts for {} entity masks",
            entity_prompt_emb.dim().1,
            entity_masks.dim().1
        )));
    }

    let foreground = enable_inpaint.then(|| {
        Array2::from_shape_fn((height, width), |(y, x)| {
            (0..entity_masks.dim().1).any(|n| entity_masks[[0, n, 0, y, x]] > 0.0)
        })
    });

    let negative = negative.map(|neg| {
        let (batch, seq, dim) = neg.prompt_emb.dim();
        let n = entity_masks.dim().1;
        EntityConditioning {
            entity_prompt_emb: Array4::from_shape_fn((batch, n, seq, dim), |(b, _, s, d)| {
                neg.prompt_emb[[b, s, d]]
            }),
            entity_masks: entity_masks.clone(),
        }
    });

    Ok(EntityInputs {
        positive: EntityConditioning {
            entity_prompt_emb,
            entity_masks,
        },
        negative,
        foreground,
    })
}

/// Resizes reference images to `size`×`size`, batches and encodes them.
pub fn encode_reference_images(
    encoder: &dyn ImageEncoder,
    images: &[PixelImage],
    size: usize,
) -> Result<Array2<f32>> {
    let resized: Vec<Array4<f32>> = images
        .iter()
        .map(|image| image.resize_bilinear(size, size).into_tensor())
        .collect();
    let views: Vec<_> = resized.iter().map(|t| t.view()).collect();
    let batch = concatenate(Axis(0), &views)?;
    encoder.encode(&batch)
}

/// Adapter injections for the positive side and for a zero embedding at scale 1.
pub fn prepare_adapter_injections(
    adapter: &dyn IpAdapter,
    image_embedding: &Array2<f32>,
    scale: f32,
) -> Result<(AdapterInjections, AdapterInjections)> {
    let positive = adapter.forward(image_embedding, scale)?;
    let negative = adapter.forward(&Array2::zeros(image_embedding.raw_dim()), 1.0)?;
    Ok((positive, negative))
}

/// Encodes control images into one latent frame per unit.
///
/// A single image is shared by every unit. For inpaint units with a mask,
/// masked pixels are blacked out before encoding and `1 - mask` is appended
/// as an extra latent channel.
pub fn prepare_controlnet_frames(
    controlnet: &MultiControlNet,
    vae: &dyn LatentEncoder,
    images: &[PixelImage],
    inpaint_mask: Option<&Mask>,
    height: usize,
    width: usize,
    tiler: &TilerConfig,
) -> Result<Vec<Array4<f32>>> {
    if images.len() != 1 && images.len() != controlnet.len() {
        return Err(PipelineError::invalid_request(format!(
            "{} control images for {} control units",
            images.len(),
            controlnet.len()
        )));
    }

    let mut frames = Vec::with_capacity(controlnet.len());
    for (index, unit) in controlnet.units().iter().enumerate() {
        let source = &images[index.min(images.len() - 1)];
        let source = if source.height() != height || source.width() != width {
            debug!(
                unit = index,
                from = ?(source.height(), source.width()),
                to = ?(height, width),
                "Resizing control image"
            );
            source.resize_bilinear(height, width)
        } else {
            source.clone()
        };

        let mut image = controlnet.process_image(&source, index)?;
        let mask = inpaint_mask.filter(|_| unit.processor.is_inpaint());
        if let Some(mask) = mask {
            image = image.masked(mask);
        }

        let mut frame = vae.encode(&image, tiler)?;
        if let Some(mask) = mask {
            frame = append_mask_channel(frame, mask)?;
        }
        debug!(
            unit = index,
            processor = unit.processor.as_str(),
            shape = ?frame.shape(),
            "Prepared control frame"
        );
        frames.push(frame);
    }
    Ok(frames)
}

fn append_mask_channel(latents: Array4<f32>, mask: &Mask) -> Result<Array4<f32>> {
    let (batch, _, height, width) = latents.dim();
    let resized = mask.resize_nearest(height, width);
    let channel =
        Array4::from_shape_fn((batch, 1, height, width), |(_, _, y, x)| 1.0 - resized[[y, x]]);
    Ok(concatenate(Axis(1), &[latents.view(), channel.view()])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ControlNetUnit, ControlProcessor};
    use crate::testing::{
        prompt_embedding, FixedImageEncoder, FixedIpAdapter, MockBackbone, MockVae,
        ScaledControlNet,
    };
    use ndarray::s;

    fn unit(processor: ControlProcessor) -> ControlNetUnit {
        ControlNetUnit::new(processor, Box::new(ScaledControlNet::new(1, 1)), 1.0)
    }

    fn left_half(h: usize, w: usize) -> Mask {
        Mask::new(Array2::from_shape_fn((h, w), |(_, x)| if x < w / 2 { 1.0 } else { 0.0 }))
    }

    #[test]
    fn extra_input_shapes() {
        let dit = MockBackbone::new(1, 1);
        let latents = Array4::zeros((1, 16, 4, 6));
        let extra = prepare_extra_input(&dit, &latents, 3.5);
        assert_eq!(extra.image_ids.dim(), (1, 6, 3));
        assert_eq!(extra.guidance.to_vec(), vec![3.5]);
    }

    #[test]
    fn local_masks_are_binary_at_latent_size() {
        let masks = prepare_local_masks([&left_half(64, 64)], 8, 8);
        assert_eq!(masks[0].dim(), (8, 8));
        assert_eq!(masks[0][[0, 0]], 1.0);
        assert_eq!(masks[0][[0, 7]], 0.0);
    }

    #[test]
    fn mask_aspect_is_checked() {
        let request = GenerationRequest::new("x").with_local_prompt("y", left_half(32, 64), 1.0);
        assert!(check_mask_aspects(&request, 64, 128).is_ok());
        assert_eq!(
            check_mask_aspects(&request, 64, 64).unwrap_err().code,
            crate::error::ErrorCode::MaskMismatch
        );
    }

    #[test]
    fn entity_inputs_with_inpaint_and_negative() {
        let a = left_half(32, 32);
        let b = Mask::new(Array2::zeros((32, 32)));
        let emb = Array4::ones((1, 2, 4, 8));
        let negative = prompt_embedding(0.5);

        let inputs = prepare_entity_inputs(emb, &[&a, &b], Some(&negative), true, 4, 4).unwrap();
        assert_eq!(inputs.positive.entity_masks.dim(), (1, 2, 1, 4, 4));
        assert_eq!(inputs.positive.num_entities(), 2);

        let fg = inputs.foreground.unwrap();
        assert!(fg[[0, 0]] && fg[[3, 1]]);
        assert!(!fg[[0, 2]] && !fg[[3, 3]]);

        let neg = inputs.negative.unwrap();
        assert_eq!(neg.entity_masks, inputs.positive.entity_masks);
        assert_eq!(neg.entity_prompt_emb.dim().1, 2);
        assert!(neg.entity_prompt_emb.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn entity_count_mismatch() {
        let a = left_half(32, 32);
        let emb = Array4::ones((1, 2, 4, 8));
        assert!(prepare_entity_inputs(emb, &[&a], None, false, 4, 4).is_err());
    }

    #[test]
    fn reference_images_are_resized() {
        let encoder = FixedImageEncoder::new();
        let images = vec![
            PixelImage::new(Array4::zeros((1, 3, 100, 50))),
            PixelImage::new(Array4::zeros((1, 3, 20, 20))),
        ];
        let embedding = encode_reference_images(&encoder, &images, 384).unwrap();
        assert_eq!(embedding.nrows(), 2);
        assert_eq!(encoder.seen_shapes(), vec![vec![2, 3, 384, 384]]);
    }

    #[test]
    fn negative_injections_use_zero_embedding() {
        let adapter = FixedIpAdapter::new();
        let embedding = Array2::from_elem((1, 4), 2.0);
        let (posi, nega) = prepare_adapter_injections(&adapter, &embedding, 0.7).unwrap();
        assert_eq!(posi[&0].scale, 0.7);
        assert!(posi[&0].ip_k.iter().all(|&v| v == 2.0));
        assert_eq!(nega[&0].scale, 1.0);
        assert!(nega[&0].ip_k.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn inpaint_control_frame_gets_mask_channel() {
        let controlnet = MultiControlNet::new(vec![
            unit(ControlProcessor::Passthrough),
            unit(ControlProcessor::Inpaint),
        ]);
        let image = PixelImage::new(Array4::ones((1, 3, 32, 32)));
        let mask = left_half(32, 32);
        let frames = prepare_controlnet_frames(
            &controlnet,
            &MockVae,
            &[image],
            Some(&mask),
            32,
            32,
            &TilerConfig::default(),
        )
        .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].dim(), (1, 16, 4, 4));
        assert!(frames[0].iter().all(|&v| v == 1.0));

        assert_eq!(frames[1].dim(), (1, 17, 4, 4));
        // Masked pixels are blacked out, the extra channel is 1 - mask.
        assert_eq!(frames[1][[0, 0, 0, 0]], -1.0);
        assert_eq!(frames[1][[0, 0, 0, 3]], 1.0);
        assert_eq!(frames[1].slice(s![0, 16, .., ..2]).sum(), 0.0);
        assert_eq!(frames[1].slice(s![0, 16, .., 2..]).sum(), 8.0);
    }

    #[test]
    fn control_image_count_must_match() {
        let controlnet = MultiControlNet::new(vec![
            unit(ControlProcessor::Passthrough),
            unit(ControlProcessor::Passthrough),
            unit(ControlProcessor::Passthrough),
        ]);
        let image = PixelImage::new(Array4::ones((1, 3, 16, 16)));
        let result = prepare_controlnet_frames(
            &controlnet,
            &MockVae,
            &[image.clone(), image],
            None,
            16,
            16,
            &TilerConfig::default(),
        );
        assert!(result.is_err());
    }
}
