//! Core types for the flux pipeline.
//!
//! - [`PixelImage`] and [`Mask`]: pixel-space inputs and outputs
//! - [`GenerationRequest`]: one pipeline call with its optional feature groups

mod image;
mod request;

pub use image::{Mask, PixelImage, MASK_THRESHOLD};
pub use request::{
    ControlNetInput, EligenInput, EntityPrompt, GenerationRequest, IpAdapterInput, LocalPrompt,
};
