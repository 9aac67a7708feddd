//! Noise-prediction fusion: guidance, regional overrides and inpainting.

use ndarray::{Array2, Array4, Axis, Zip};

use crate::error::{PipelineError, Result};

/// A region prediction with its latent-resolution mask and weight.
#[derive(Debug, Clone)]
pub struct RegionPrediction {
    /// Prediction evaluated with the region's prompt.
    pub prediction: Array4<f32>,
    /// Binary region mask at latent resolution, shape `(h, w)`.
    pub mask: Array2<f32>,
    /// Region weight.
    pub scale: f32,
}

/// Classifier-free guidance: `negative + scale * (positive - negative)`.
pub fn classifier_free_guidance(
    positive: &Array4<f32>,
    negative: &Array4<f32>,
    cfg_scale: f32,
) -> Result<Array4<f32>> {
    if positive.dim() != negative.dim() {
        return Err(PipelineError::shape_mismatch(
            "negative prediction",
            negative.shape(),
            positive.shape(),
        ));
    }
    Ok(negative + &((positive - negative) * cfg_scale))
}

/// Overrides `global` inside every region.
///
/// Where the summed region weight `W = Σ mask * scale` is positive the
/// result is `Σ prediction * mask * scale / W`; elsewhere it is `global`.
pub fn merge_local_predictions(
    global: &Array4<f32>,
    regions: &[RegionPrediction],
) -> Result<Array4<f32>> {
    if regions.is_empty() {
        return Ok(global.clone());
    }
    let (_, _, height, width) = global.dim();
    let mut weighted = Array4::<f32>::zeros(global.raw_dim());
    let mut total = Array2::<f32>::zeros((height, width));

    for region in regions {
        if region.prediction.dim() != global.dim() {
            return Err(PipelineError::shape_mismatch(
                "region prediction",
                region.prediction.shape(),
                global.shape(),
            ));
        }
        if region.mask.dim() != (height, width) {
            return Err(PipelineError::mask_mismatch(region.mask.dim(), (height, width)));
        }
        let weight = &region.mask * region.scale;
        weighted += &(&region.prediction * &weight);
        total += &weight;
    }

    let mut merged = global.clone();
    for (mut out_b, acc_b) in merged.axis_iter_mut(Axis(0)).zip(weighted.axis_iter(Axis(0))) {
        for (mut out_c, acc_c) in out_b.axis_iter_mut(Axis(0)).zip(acc_b.axis_iter(Axis(0))) {
            Zip::from(&mut out_c).and(&acc_c).and(&total).for_each(|out, &acc, &w| {
                if w > 0.0 {
                    *out = acc / w;
                }
            });
        }
    }
    Ok(merged)
}

/// Keeps the unmasked background on the path back to `input_latents`.
///
/// Inside `foreground` (a `(h, w)` boolean map broadcast over channels) the
/// prediction is used as is. Outside it the flow that leads from `latents`
/// back to the clean input, `(latents - input_latents) / sigma`, is blended
/// with the prediction as `(inpaint + bw * pred) / (1 + bw)`.
pub fn inpaint_fusion(
    latents: &Array4<f32>,
    input_latents: &Array4<f32>,
    prediction: &Array4<f32>,
    foreground: &Array2<bool>,
    sigma: f32,
    background_weight: f32,
) -> Result<Array4<f32>> {
    if !(sigma > 0.0) {
        return Err(PipelineError::invalid_request(format!(
            "inpaint fusion needs a positive sigma, got {}",
            sigma
        )));
    }
    if input_latents.dim() != latents.dim() {
        return Err(PipelineError::shape_mismatch(
            "input latents",
            input_latents.shape(),
            latents.shape(),
        ));
    }
    if prediction.dim() != latents.dim() {
        return Err(PipelineError::shape_mismatch(
            "prediction",
            prediction.shape(),
            latents.shape(),
        ));
    }
    let (_, _, height, width) = latents.dim();
    if foreground.dim() != (height, width) {
        return Err(PipelineError::mask_mismatch(foreground.dim(), (height, width)));
    }

    let mut fused = (latents - input_latents) / sigma;
    for (mut out_b, pred_b) in fused.axis_iter_mut(Axis(0)).zip(prediction.axis_iter(Axis(0))) {
        for (mut out_c, pred_c) in out_b.axis_iter_mut(Axis(0)).zip(pred_b.axis_iter(Axis(0))) {
            Zip::from(&mut out_c).and(&pred_c).and(foreground).for_each(|out, &pred, &fg| {
                *out = if fg {
                    pred
                } else {
                    (*out + pred * background_weight) / (1.0 + background_weight)
                };
            });
        }
    }
    Ok(fused)
}
