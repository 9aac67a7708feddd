//! Deterministic stand-ins for the model collaborators, shared by unit tests.
//!
//! Every mock acts per latent location (apart from constants derived from
//! the prompt and timestep), so tiled and untiled evaluation agree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD};

use crate::config::{TilerConfig, LATENT_CHANNELS, VAE_SCALE_FACTOR};
use crate::error::{PipelineError, Result};
use crate::models::backbone::{concat_ids, patchify};
use crate::models::{
    AdapterInjections, Annotator, Backbone, BlockAdapterKwargs, BlockInput, ControlNet,
    ControlNetContext, ControlProcessor, ControlResiduals, DeviceManager, EntityConditioning,
    EntityContext, ImageEncoder, IpAdapter, LatentDecoder, LatentEncoder, ModelRole,
    PromptEmbedding, PromptRefiner, TextEncoder,
};
use crate::types::PixelImage;

const EMBED_DIM: usize = 8;
const TOKEN_DIM: usize = LATENT_CHANNELS * 4;

/// A prompt embedding of 4 tokens with every value set to `value`.
pub fn prompt_embedding(value: f32) -> PromptEmbedding {
    PromptEmbedding {
        prompt_emb: Array3::from_elem((1, 4, EMBED_DIM), value),
        pooled_prompt_emb: Array2::from_elem((1, EMBED_DIM), value),
        text_ids: Array3::zeros((1, 4, 3)),
    }
}

/// Text encoder deriving a constant embedding from the prompt bytes.
#[derive(Clone, Default)]
pub struct MockTextEncoder {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockTextEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of encode calls so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Every encoded prompt, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(&self, prompt: &str, sequence_length: usize) -> Result<PromptEmbedding> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let value = prompt.bytes().map(u32::from).sum::<u32>() % 97;
        let value = value as f32 / 97.0;
        Ok(PromptEmbedding {
            prompt_emb: Array3::from_shape_fn((1, sequence_length, EMBED_DIM), |(_, _, d)| {
                value + 0.01 * d as f32
            }),
            pooled_prompt_emb: Array2::from_elem((1, EMBED_DIM), value),
            text_ids: Array3::zeros((1, sequence_length, 3)),
        })
    }
}

/// Appends a fixed suffix.
pub struct SuffixRefiner(pub &'static str);

impl PromptRefiner for SuffixRefiner {
    fn refine(&self, prompt: &str) -> Result<String> {
        Ok(format!("{}{}", prompt, self.0))
    }
}

/// Block-averaging encoder and nearest-upsampling decoder.
///
/// Latent channel `k` holds the 8x8 block mean of pixel channel `k % 3`;
/// decoding copies latent channels 0..3 back to pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockVae;

impl LatentEncoder for MockVae {
    fn encode(&self, image: &PixelImage, _tiler: &TilerConfig) -> Result<Array4<f32>> {
        let pixels = image.tensor();
        let (batch, channels, height, width) = pixels.dim();
        let f = VAE_SCALE_FACTOR;
        if height % f != 0 || width % f != 0 {
            return Err(PipelineError::shape_mismatch(
                "image",
                pixels.shape(),
                &[batch, channels, height / f * f, width / f * f],
            ));
        }
        Ok(Array4::from_shape_fn(
            (batch, LATENT_CHANNELS, height / f, width / f),
            |(b, k, y, x)| {
                pixels
                    .slice(s![b, k % channels, y * f..(y + 1) * f, x * f..(x + 1) * f])
                    .mean()
                    .unwrap_or(0.0)
            },
        ))
    }
}

impl LatentDecoder for MockVae {
    fn decode(&self, latents: &Array4<f32>, _tiler: &TilerConfig) -> Result<PixelImage> {
        let (batch, _, height, width) = latents.dim();
        let f = VAE_SCALE_FACTOR;
        Ok(PixelImage::new(Array4::from_shape_fn(
            (batch, 3, height * f, width * f),
            |(b, c, y, x)| latents[[b, c, y / f, x / f]],
        )))
    }
}

/// One recorded backbone block call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCall {
    Joint { index: usize, adapter: bool },
    Single { index: usize, adapter: bool },
}

/// Elementwise backbone with a 64-wide token space (16 channels x 2x2 patch).
#[derive(Clone)]
pub struct MockBackbone {
    joint: usize,
    single: usize,
    forward_calls: Arc<AtomicUsize>,
    entity_calls: Arc<AtomicUsize>,
    blocks: Arc<Mutex<Vec<BlockCall>>>,
}

impl MockBackbone {
    pub fn new(joint: usize, single: usize) -> Self {
        Self {
            joint,
            single,
            forward_calls: Arc::default(),
            entity_calls: Arc::default(),
            blocks: Arc::default(),
        }
    }

    /// Number of evaluations (counted at the time embedding).
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Number of entity-mask evaluations.
    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    /// Every block call so far.
    pub fn block_calls(&self) -> Vec<BlockCall> {
        self.blocks.lock().unwrap().clone()
    }

    fn shift(input: &BlockInput<'_>, prompt_tokens: &Array3<f32>) -> f32 {
        let adapter = input
            .adapter
            .map_or(0.0, |a| a.scale * a.ip_k.mean().unwrap_or(0.0) * 0.1);
        input.conditioning.mean().unwrap_or(0.0) * 0.05
            + prompt_tokens.mean().unwrap_or(0.0) * 0.2
            + adapter
    }
}

impl Backbone for MockBackbone {
    fn num_joint_blocks(&self) -> usize {
        self.joint
    }

    fn num_single_blocks(&self) -> usize {
        self.single
    }

    fn has_guidance_embedder(&self) -> bool {
        true
    }

    fn time_embed(&self, timestep: &Array1<f32>) -> Result<Array2<f32>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Array2::from_shape_fn((timestep.len(), TOKEN_DIM), |(b, _)| timestep[b] / 1000.0))
    }

    fn pooled_text_embed(&self, pooled: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(Array2::from_shape_fn((pooled.nrows(), TOKEN_DIM), |(b, _)| {
            pooled.row(b).mean().unwrap_or(0.0)
        }))
    }

    fn guidance_embed(&self, guidance: &Array1<f32>) -> Result<Array2<f32>> {
        Ok(Array2::from_shape_fn((guidance.len(), TOKEN_DIM), |(b, _)| guidance[b] / 10000.0))
    }

    fn embed_image(&self, patches: &Array3<f32>) -> Result<Array3<f32>> {
        if patches.dim().2 != TOKEN_DIM {
            let (batch, tokens, _) = patches.dim();
            return Err(PipelineError::shape_mismatch(
                "patches",
                patches.shape(),
                &[batch, tokens, TOKEN_DIM],
            ));
        }
        Ok(patches.clone())
    }

    fn embed_context(&self, prompt_emb: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, dim) = prompt_emb.dim();
        Ok(Array3::from_shape_fn((batch, seq, TOKEN_DIM), |(b, t, f)| prompt_emb[[b, t, f % dim]]))
    }

    fn positional_encoding(&self, ids: &Array3<f32>) -> Result<ArrayD<f32>> {
        Ok(ids.clone().into_dyn())
    }

    fn process_entity_masks(
        &self,
        _image_tokens: &Array3<f32>,
        prompt_emb: &Array3<f32>,
        entity: &EntityConditioning,
        text_ids: &Array3<f32>,
        image_ids: &Array3<f32>,
    ) -> Result<EntityContext> {
        self.entity_calls.fetch_add(1, Ordering::SeqCst);
        let entity_mean = entity.entity_prompt_emb.mean().unwrap_or(0.0);
        Ok(EntityContext {
            prompt_tokens: self.embed_context(prompt_emb)? + entity_mean * 0.1,
            positional: concat_ids(text_ids, image_ids)?.into_dyn(),
            attention_mask: None,
        })
    }

    fn joint_block(
        &self,
        index: usize,
        image_tokens: Array3<f32>,
        prompt_tokens: Array3<f32>,
        input: &BlockInput<'_>,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        self.blocks.lock().unwrap().push(BlockCall::Joint {
            index,
            adapter: input.adapter.is_some(),
        });
        let shift = Self::shift(input, &prompt_tokens);
        Ok((image_tokens * 0.9 + shift, prompt_tokens))
    }

    fn single_block(
        &self,
        index: usize,
        hidden_states: Array3<f32>,
        prompt_tokens: Array3<f32>,
        input: &BlockInput<'_>,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        self.blocks.lock().unwrap().push(BlockCall::Single {
            index,
            adapter: input.adapter.is_some(),
        });
        let shift = Self::shift(input, &prompt_tokens);
        Ok((hidden_states * 0.9 + shift, prompt_tokens))
    }

    fn final_norm_out(
        &self,
        tokens: &Array3<f32>,
        _conditioning: &Array2<f32>,
    ) -> Result<Array3<f32>> {
        Ok(tokens.clone())
    }

    fn final_proj_out(&self, tokens: &Array3<f32>) -> Result<Array3<f32>> {
        Ok(tokens.clone())
    }
}

/// Control model whose residuals are the patchified frame (first 16 channels).
#[derive(Clone)]
pub struct ScaledControlNet {
    joint: usize,
    single: usize,
    frames: Arc<Mutex<Vec<Array4<f32>>>>,
}

impl ScaledControlNet {
    pub fn new(joint: usize, single: usize) -> Self {
        Self {
            joint,
            single,
            frames: Arc::default(),
        }
    }

    /// Every frame passed to `forward`, in call order.
    pub fn seen_frames(&self) -> Vec<Array4<f32>> {
        self.frames.lock().unwrap().clone()
    }
}

impl ControlNet for ScaledControlNet {
    fn forward(
        &self,
        frame: &Array4<f32>,
        _processor: &ControlProcessor,
        _context: &ControlNetContext<'_>,
    ) -> Result<ControlResiduals> {
        self.frames.lock().unwrap().push(frame.clone());
        let channels = frame.dim().1.min(LATENT_CHANNELS);
        let residual = patchify(&frame.slice(s![.., ..channels, .., ..]).to_owned())?;
        Ok(ControlResiduals {
            joint: vec![residual.clone(); self.joint],
            single: vec![residual; self.single],
        })
    }
}

/// Annotator replacing the control image with a constant, recording input sizes.
#[derive(Clone)]
pub struct RecordingAnnotator {
    value: f32,
    sizes: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl RecordingAnnotator {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            sizes: Arc::default(),
        }
    }

    pub fn seen_sizes(&self) -> Vec<(usize, usize)> {
        self.sizes.lock().unwrap().clone()
    }
}

impl Annotator for RecordingAnnotator {
    fn process(&self, image: &PixelImage) -> Result<PixelImage> {
        self.sizes.lock().unwrap().push((image.height(), image.width()));
        Ok(PixelImage::new(Array4::from_elem(image.tensor().raw_dim(), self.value)))
    }
}

/// Image encoder returning ones and recording input shapes.
#[derive(Clone, Default)]
pub struct FixedImageEncoder {
    shapes: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl FixedImageEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_shapes(&self) -> Vec<Vec<usize>> {
        self.shapes.lock().unwrap().clone()
    }
}

impl ImageEncoder for FixedImageEncoder {
    fn encode(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.shapes.lock().unwrap().push(images.shape().to_vec());
        Ok(Array2::ones((images.dim().0, 4)))
    }
}

/// Adapter injecting into block 0 and recording scales.
#[derive(Clone, Default)]
pub struct FixedIpAdapter {
    scales: Arc<Mutex<Vec<f32>>>,
}

impl FixedIpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scales(&self) -> Vec<f32> {
        self.scales.lock().unwrap().clone()
    }
}

impl IpAdapter for FixedIpAdapter {
    fn forward(&self, image_embedding: &Array2<f32>, scale: f32) -> Result<AdapterInjections> {
        self.scales.lock().unwrap().push(scale);
        let value = image_embedding.mean().unwrap_or(0.0);
        let kwargs = BlockAdapterKwargs {
            ip_k: Array3::from_elem((1, 1, 4), value),
            ip_v: Array3::from_elem((1, 1, 4), value),
            scale,
        };
        Ok(HashMap::from([(0, kwargs)]))
    }
}

/// A residency change seen by [`RecordingDeviceManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidencyEvent {
    Load(Vec<ModelRole>),
    Offload(Vec<ModelRole>),
}

/// Device manager recording every load and offload.
#[derive(Clone, Default)]
pub struct RecordingDeviceManager {
    events: Arc<Mutex<Vec<ResidencyEvent>>>,
}

impl RecordingDeviceManager {
    pub fn events(&self) -> Vec<ResidencyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl DeviceManager for RecordingDeviceManager {
    fn load(&self, roles: &[ModelRole]) {
        self.events.lock().unwrap().push(ResidencyEvent::Load(roles.to_vec()));
    }

    fn offload(&self, roles: &[ModelRole]) {
        self.events.lock().unwrap().push(ResidencyEvent::Offload(roles.to_vec()));
    }
}
