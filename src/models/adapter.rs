//! Reference-image adapter contracts.
//!
//! An image encoder turns reference images into a pooled embedding; the
//! adapter projects that embedding into per-block key/value injections
//! indexed by backbone block number.

use std::collections::HashMap;

use ndarray::{Array2, Array3, Array4};

use crate::error::Result;

/// Extra attention keys and values injected into one backbone block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAdapterKwargs {
    /// Projected keys, shape `(batch, tokens, dim)`.
    pub ip_k: Array3<f32>,
    /// Projected values, shape `(batch, tokens, dim)`.
    pub ip_v: Array3<f32>,
    /// Strength of the injection.
    pub scale: f32,
}

/// Block index to injection. Joint blocks use their own index, single
/// blocks are offset by the number of joint blocks.
pub type AdapterInjections = HashMap<usize, BlockAdapterKwargs>;

/// Vision encoder producing pooled reference-image embeddings.
pub trait ImageEncoder {
    /// Encodes `(n, 3, H, W)` images into a `(n, dim)` pooled embedding.
    fn encode(&self, images: &Array4<f32>) -> Result<Array2<f32>>;
}

/// Reference-image adapter.
pub trait IpAdapter {
    /// Projects an image embedding into per-block injections.
    fn forward(&self, image_embedding: &Array2<f32>, scale: f32) -> Result<AdapterInjections>;
}
