//! Flux image pipeline.
//!
//! Orchestrates latent preparation, prompt encoding, conditioning assembly,
//! the denoising loop and decoding for one [`GenerationRequest`].

use std::fmt;

use ndarray::{Array2, Array4};
use tracing::{debug, info, warn};

use crate::config::{
    round_to_divisor, PipelineConfig, TilerConfig, LATENT_CHANNELS, VAE_SCALE_FACTOR,
};
use crate::error::{PipelineError, Result};
use crate::models::{
    AdapterInjections, Backbone, DeviceManager, ImageEncoder, IpAdapter, LatentDecoder,
    LatentEncoder, ModelRegistry, ModelRole, MultiControlNet, PromptEmbedding, PromptRefiner,
    StageScope, TextEncoder,
};
use crate::types::{GenerationRequest, PixelImage};

use super::conditioning::{
    check_mask_aspects, encode_reference_images, prepare_adapter_injections,
    prepare_controlnet_frames, prepare_entity_inputs, prepare_extra_input, prepare_local_masks,
    ConditioningBundle, EntityInputs,
};
use super::denoise::DenoisingEvaluator;
use super::fusion::{
    classifier_free_guidance, inpaint_fusion, merge_local_predictions, RegionPrediction,
};
use super::latent::{generate_noise, latent_shape, resolve_seed};
use super::prompter::Prompter;
use super::scheduler::FlowMatchScheduler;

/// Progress of one call through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Nothing prepared yet.
    Init,
    /// Initial latents exist.
    LatentsReady,
    /// Prompt embeddings exist.
    PromptsReady,
    /// Every conditioning bundle is built.
    ConditioningReady,
    /// Running schedule level `step` of `total`.
    Denoising { step: usize, total: usize },
    /// The image has been decoded.
    Decoded,
}

impl PipelineStage {
    fn ordinal(&self) -> usize {
        match self {
            PipelineStage::Init => 0,
            PipelineStage::LatentsReady => 1,
            PipelineStage::PromptsReady => 2,
            PipelineStage::ConditioningReady => 3,
            PipelineStage::Denoising { .. } => 4,
            PipelineStage::Decoded => 5,
        }
    }

    /// Returns true if `next` directly follows this stage.
    pub fn can_advance_to(&self, next: &PipelineStage) -> bool {
        match (self, next) {
            (PipelineStage::ConditioningReady, PipelineStage::Denoising { step, .. }) => *step == 0,
            (
                PipelineStage::Denoising { step, total },
                PipelineStage::Denoising {
                    step: next,
                    total: next_total,
                },
            ) => *next == step + 1 && next_total == total,
            (PipelineStage::Denoising { step, total }, PipelineStage::Decoded) => {
                step + 1 == *total
            }
            (PipelineStage::Denoising { .. }, _) | (_, PipelineStage::Denoising { .. }) => false,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Init => write!(f, "init"),
            PipelineStage::LatentsReady => write!(f, "latents_ready"),
            PipelineStage::PromptsReady => write!(f, "prompts_ready"),
            PipelineStage::ConditioningReady => write!(f, "conditioning_ready"),
            PipelineStage::Denoising { step, total } => {
                write!(f, "denoising({}/{})", step + 1, total)
            }
            PipelineStage::Decoded => write!(f, "decoded"),
        }
    }
}

fn advance(stage: &mut PipelineStage, next: PipelineStage) {
    debug_assert!(stage.can_advance_to(&next), "invalid transition {} -> {}", stage, next);
    debug!(from = %stage, to = %next, "Pipeline stage");
    *stage = next;
}

/// Embeddings produced by the prompt stage.
struct PromptSet {
    positive: PromptEmbedding,
    negative: Option<PromptEmbedding>,
    locals: Vec<PromptEmbedding>,
    entities: Option<Array4<f32>>,
}

/// A local prompt ready for evaluation.
struct LocalRegion<'a> {
    bundle: ConditioningBundle<'a>,
    mask: Array2<f32>,
    scale: f32,
}

/// Text-to-image pipeline over a Flux-style backbone.
pub struct FluxImagePipeline {
    config: PipelineConfig,
    text_encoder: Box<dyn TextEncoder>,
    prompt_refiners: Vec<Box<dyn PromptRefiner>>,
    dit: Box<dyn Backbone>,
    vae_encoder: Option<Box<dyn LatentEncoder>>,
    vae_decoder: Box<dyn LatentDecoder>,
    controlnet: Option<MultiControlNet>,
    ipadapter: Option<Box<dyn IpAdapter>>,
    ipadapter_image_encoder: Option<Box<dyn ImageEncoder>>,
    device_manager: Box<dyn DeviceManager>,
}

impl fmt::Debug for FluxImagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FluxImagePipeline")
            .field("config", &self.config)
            .field("controlnet", &self.controlnet)
            .finish_non_exhaustive()
    }
}

impl FluxImagePipeline {
    /// Resolves every model role from `registry`.
    ///
    /// The text encoder, backbone and latent decoder are required; every
    /// other role is optional and only checked when a request needs it.
    pub fn new(
        registry: ModelRegistry,
        config: PipelineConfig,
        device_manager: Box<dyn DeviceManager>,
    ) -> Result<Self> {
        config.validate()?;
        let ModelRegistry {
            text_encoder,
            prompt_refiners,
            dit,
            vae_encoder,
            vae_decoder,
            controlnet_units,
            ipadapter,
            ipadapter_image_encoder,
        } = registry;

        let required = |role: ModelRole| move || PipelineError::missing_model(role);
        let pipeline = Self {
            config,
            text_encoder: text_encoder.ok_or_else(required(ModelRole::TextEncoder))?,
            prompt_refiners,
            dit: dit.ok_or_else(required(ModelRole::Dit))?,
            vae_encoder,
            vae_decoder: vae_decoder.ok_or_else(required(ModelRole::VaeDecoder))?,
            controlnet: (!controlnet_units.is_empty())
                .then(|| MultiControlNet::new(controlnet_units)),
            ipadapter,
            ipadapter_image_encoder,
            device_manager,
        };
        info!(
            joint_blocks = pipeline.dit.num_joint_blocks(),
            single_blocks = pipeline.dit.num_single_blocks(),
            controlnet_units = pipeline.controlnet.as_ref().map_or(0, |c| c.len()),
            ipadapter = pipeline.ipadapter.is_some(),
            "Pipeline ready"
        );
        Ok(pipeline)
    }

    /// Returns the pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Output size for `request`, rounded to a multiple of 16.
    pub fn resolve_size(&self, request: &GenerationRequest) -> (usize, usize) {
        let height = request.height.unwrap_or(self.config.height);
        let width = request.width.unwrap_or(self.config.width);
        let rounded = (round_to_divisor(height), round_to_divisor(width));
        if rounded != (height, width) {
            warn!(
                requested = ?(height, width),
                rounded = ?rounded,
                "Height and width must be multiples of 16, size was rounded"
            );
        }
        rounded
    }

    /// Generates one image.
    ///
    /// `on_progress` receives `(step, total)` after every denoising step and
    /// a final `(total, total)` once the loop is done.
    pub fn generate<F>(&self, request: &GenerationRequest, mut on_progress: F) -> Result<PixelImage>
    where
        F: FnMut(usize, usize),
    {
        request.validate()?;
        self.check_models(request)?;

        let mut stage = PipelineStage::Init;
        let (height, width) = self.resolve_size(request);
        check_mask_aspects(request, height, width)?;

        let tiler = request.tiler.unwrap_or(self.config.tiler);
        let steps = request.inference_steps.unwrap_or(self.config.inference_steps);
        let guidance = request.embedded_guidance.unwrap_or(self.config.embedded_guidance);
        let sequence_length = request.t5_sequence_length.unwrap_or(self.config.t5_sequence_length);
        let cfg_scale = request.cfg_scale;
        info!(height, width, steps, cfg_scale, tiled = tiler.tiled, "Starting generation");

        let mut scheduler = FlowMatchScheduler::new(self.config.scheduler);
        scheduler.set_timesteps(steps, request.denoising_strength)?;

        // Latents
        let seed = resolve_seed(request.seed);
        let (mut latents, input_latents) =
            self.prepare_latents(request, height, width, seed, &scheduler, &tiler)?;
        advance(&mut stage, PipelineStage::LatentsReady);

        // Prompts
        let prompts = self.prepare_prompts(request, sequence_length)?;
        advance(&mut stage, PipelineStage::PromptsReady);

        // Conditioning
        let (latent_h, latent_w) = (height / VAE_SCALE_FACTOR, width / VAE_SCALE_FACTOR);
        let extra = prepare_extra_input(self.dit.as_ref(), &latents, guidance);
        let entity = self.prepare_eligen(request, &prompts, latent_h, latent_w)?;
        let (adapter_posi, adapter_nega) = self.prepare_ipadapter(request)?;
        let (control_posi, control_locals) =
            self.prepare_controlnet(request, height, width, &tiler)?;
        let control_on_negative = request.controlnet.as_ref().is_some_and(|c| c.enable_on_negative);

        let bundle_posi = ConditioningBundle::new(&prompts.positive, &extra, &adapter_posi)
            .with_controlnet_frames(control_posi.as_deref())
            .with_entity(entity.as_ref().map(|e| &e.positive));
        let bundle_nega = prompts.negative.as_ref().map(|negative| {
            ConditioningBundle::new(negative, &extra, &adapter_nega)
                .with_controlnet_frames(control_posi.as_deref().filter(|_| control_on_negative))
                .with_entity(entity.as_ref().and_then(|e| e.negative.as_ref()))
        });
        let local_masks = prepare_local_masks(
            request.local_prompts.iter().map(|l| &l.mask),
            latent_h,
            latent_w,
        );
        let locals: Vec<LocalRegion<'_>> = prompts
            .locals
            .iter()
            .zip(local_masks)
            .zip(&request.local_prompts)
            .enumerate()
            .map(|(i, ((embedding, mask), local))| {
                let frames = match &control_locals {
                    Some(per_region) => Some(per_region[i].as_slice()),
                    None => control_posi.as_deref(),
                };
                LocalRegion {
                    bundle: ConditioningBundle {
                        prompt: embedding,
                        controlnet_frames: frames,
                        ..bundle_posi
                    },
                    mask,
                    scale: local.scale,
                }
            })
            .collect();
        let inpaint = match (&entity, &input_latents, &request.eligen) {
            (Some(EntityInputs { foreground: Some(fg), .. }), Some(input), Some(eligen)) => {
                Some((fg, input, eligen.background_weight))
            }
            _ => None,
        };
        advance(&mut stage, PipelineStage::ConditioningReady);

        // Denoise
        let evaluator = DenoisingEvaluator::new(self.dit.as_ref(), self.controlnet.as_ref());
        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();
        {
            let _scope = self.stage_scope(&self.denoise_roles());
            for (progress_id, &timestep) in timesteps.iter().enumerate() {
                advance(&mut stage, PipelineStage::Denoising { step: progress_id, total });

                let global = evaluator.evaluate(&latents, timestep, &bundle_posi, &tiler)?;
                let mut positive = if locals.is_empty() {
                    global
                } else {
                    let regions = locals
                        .iter()
                        .map(|local| {
                            let prediction =
                                evaluator.evaluate(&latents, timestep, &local.bundle, &tiler)?;
                            Ok(RegionPrediction {
                                prediction,
                                mask: local.mask.clone(),
                                scale: local.scale,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    merge_local_predictions(&global, &regions)?
                };

                if let Some((foreground, input, background_weight)) = inpaint {
                    let sigma = scheduler.sigma_at(progress_id)?;
                    positive = inpaint_fusion(
                        &latents,
                        input,
                        &positive,
                        foreground,
                        sigma,
                        background_weight,
                    )?;
                }

                let prediction = match &bundle_nega {
                    Some(bundle) => {
                        let negative = evaluator.evaluate(&latents, timestep, bundle, &tiler)?;
                        classifier_free_guidance(&positive, &negative, cfg_scale)?
                    }
                    None => positive,
                };

                latents = scheduler.step(&prediction, timestep, &latents)?;
                debug!(step = progress_id + 1, total, timestep, "Denoising step done");
                on_progress(progress_id, total);
            }
        }
        on_progress(total, total);

        // Decode
        let image = {
            let _scope = self.stage_scope(&[ModelRole::VaeDecoder]);
            self.vae_decoder.decode(&latents, &tiler)?
        };
        advance(&mut stage, PipelineStage::Decoded);
        info!(height = image.height(), width = image.width(), seed, "Generation complete");
        Ok(image)
    }

    /// Fails if `request` needs a model that is not loaded.
    fn check_models(&self, request: &GenerationRequest) -> Result<()> {
        let needs_encoder = request.input_image.is_some() || request.controlnet.is_some();
        if needs_encoder && self.vae_encoder.is_none() {
            return Err(PipelineError::missing_model(ModelRole::VaeEncoder));
        }
        if request.controlnet.is_some() && self.controlnet.is_none() {
            return Err(PipelineError::missing_model(ModelRole::ControlNet));
        }
        if request.ipadapter.is_some() {
            if self.ipadapter_image_encoder.is_none() {
                return Err(PipelineError::missing_model(ModelRole::IpAdapterImageEncoder));
            }
            if self.ipadapter.is_none() {
                return Err(PipelineError::missing_model(ModelRole::IpAdapter));
            }
        }
        Ok(())
    }

    fn stage_scope(&self, roles: &[ModelRole]) -> StageScope<'_> {
        StageScope::acquire(self.device_manager.as_ref(), roles)
    }

    fn vae_encoder(&self) -> Result<&dyn LatentEncoder> {
        self.vae_encoder
            .as_deref()
            .ok_or_else(|| PipelineError::missing_model(ModelRole::VaeEncoder))
    }

    fn denoise_roles(&self) -> Vec<ModelRole> {
        let mut roles = vec![ModelRole::Dit];
        if self.controlnet.is_some() {
            roles.push(ModelRole::ControlNet);
        }
        roles
    }

    /// Noise, or the encoded input image blended with noise at the first level.
    fn prepare_latents(
        &self,
        request: &GenerationRequest,
        height: usize,
        width: usize,
        seed: u64,
        scheduler: &FlowMatchScheduler,
        tiler: &TilerConfig,
    ) -> Result<(Array4<f32>, Option<Array4<f32>>)> {
        let shape = latent_shape(height, width);
        let noise = generate_noise(shape, seed);
        let Some(image) = &request.input_image else {
            return Ok((noise, None));
        };

        let input_latents = {
            let _scope = self.stage_scope(&[ModelRole::VaeEncoder]);
            let image = if image.height() != height || image.width() != width {
                debug!(
                    from = ?(image.height(), image.width()),
                    to = ?(height, width),
                    "Resizing input image"
                );
                image.resize_bilinear(height, width)
            } else {
                image.clone()
            };
            self.vae_encoder()?.encode(&image, tiler)?
        };
        let (_, channels, h, w) = input_latents.dim();
        if channels != LATENT_CHANNELS || (h, w) != (shape.2, shape.3) {
            return Err(PipelineError::shape_mismatch(
                "encoded input image",
                input_latents.shape(),
                &[shape.0, shape.1, shape.2, shape.3],
            ));
        }
        let first = scheduler
            .timesteps()
            .first()
            .copied()
            .ok_or_else(PipelineError::schedule_not_set)?;
        let latents = scheduler.add_noise(&input_latents, &noise, first)?;
        Ok((latents, Some(input_latents)))
    }

    /// Encodes the positive, negative, local and entity prompts.
    fn prepare_prompts(
        &self,
        request: &GenerationRequest,
        sequence_length: usize,
    ) -> Result<PromptSet> {
        let _scope = self.stage_scope(&[ModelRole::TextEncoder]);
        let prompter = Prompter::new(self.text_encoder.as_ref(), &self.prompt_refiners);

        let positive = prompter.encode_prompt(&request.prompt, true, sequence_length)?;
        let negative = if request.cfg_scale != 1.0 {
            Some(prompter.encode_prompt(&request.negative_prompt, false, sequence_length)?)
        } else {
            None
        };
        let locals = request
            .local_prompts
            .iter()
            .map(|local| prompter.encode_prompt(&local.prompt, true, sequence_length))
            .collect::<Result<Vec<_>>>()?;
        let entities = match &request.eligen {
            Some(eligen) => {
                let texts: Vec<&str> = eligen.entities.iter().map(|e| e.prompt.as_str()).collect();
                Some(prompter.encode_entity_prompts(&texts, sequence_length)?)
            }
            None => None,
        };
        debug!(
            negative = negative.is_some(),
            locals = locals.len(),
            entities = entities.as_ref().map_or(0, |e| e.dim().1),
            "Prompts encoded"
        );
        Ok(PromptSet {
            positive,
            negative,
            locals,
            entities,
        })
    }

    fn prepare_eligen(
        &self,
        request: &GenerationRequest,
        prompts: &PromptSet,
        height: usize,
        width: usize,
    ) -> Result<Option<EntityInputs>> {
        let (Some(eligen), Some(entity_prompt_emb)) = (&request.eligen, &prompts.entities) else {
            return Ok(None);
        };
        let masks: Vec<_> = eligen.entities.iter().map(|e| &e.mask).collect();
        let negative = prompts.negative.as_ref().filter(|_| eligen.enable_on_negative);
        prepare_entity_inputs(
            entity_prompt_emb.clone(),
            &masks,
            negative,
            eligen.enable_inpaint,
            height,
            width,
        )
        .map(Some)
    }

    fn prepare_ipadapter(
        &self,
        request: &GenerationRequest,
    ) -> Result<(AdapterInjections, AdapterInjections)> {
        let (Some(input), Some(adapter), Some(image_encoder)) =
            (&request.ipadapter, &self.ipadapter, &self.ipadapter_image_encoder)
        else {
            return Ok((AdapterInjections::new(), AdapterInjections::new()));
        };
        let embedding = {
            let _scope = self.stage_scope(&[ModelRole::IpAdapterImageEncoder]);
            let size = self.config.ipadapter_image_size;
            encode_reference_images(image_encoder.as_ref(), &input.images, size)?
        };
        let _scope = self.stage_scope(&[ModelRole::IpAdapter]);
        prepare_adapter_injections(adapter.as_ref(), &embedding, input.scale)
    }

    /// Control frames for the positive side and, when an inpaint mask is
    /// overridden by local masks, one set of frames per local region.
    #[allow(clippy::type_complexity)]
    fn prepare_controlnet(
        &self,
        request: &GenerationRequest,
        height: usize,
        width: usize,
        tiler: &TilerConfig,
    ) -> Result<(Option<Vec<Array4<f32>>>, Option<Vec<Vec<Array4<f32>>>>)> {
        let (Some(input), Some(controlnet)) = (&request.controlnet, &self.controlnet) else {
            return Ok((None, None));
        };
        let _scope = self.stage_scope(&[ModelRole::VaeEncoder]);
        let vae = self.vae_encoder()?;
        let frames = prepare_controlnet_frames(
            controlnet,
            vae,
            &input.images,
            input.inpaint_mask.as_ref(),
            height,
            width,
            tiler,
        )?;

        let per_region = if input.inpaint_mask.is_some() && !request.local_prompts.is_empty() {
            warn!("The control inpaint mask is overridden by the local prompt masks");
            let regions = request
                .local_prompts
                .iter()
                .map(|local| {
                    prepare_controlnet_frames(
                        controlnet,
                        vae,
                        &input.images,
                        Some(&local.mask),
                        height,
                        width,
                        tiler,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            Some(regions)
        } else {
            None
        };
        Ok((Some(frames), per_region))
    }
}
