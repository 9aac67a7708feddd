//! Collaborator model contracts.
//!
//! The pipeline consumes every network through the traits below:
//! - [`TextEncoder`]: prompt encoding
//! - [`LatentEncoder`] / [`LatentDecoder`]: pixel and latent space conversion
//! - [`Backbone`]: the diffusion transformer, block by block
//! - [`ControlNet`]: structural control residuals
//! - [`ImageEncoder`] / [`IpAdapter`]: reference-image injections
//!
//! [`ModelRegistry`] collects loaded models by [`ModelRole`].

pub mod adapter;
pub mod backbone;
pub mod controlnet;
pub mod encoders;
pub mod registry;

// Re-export commonly used types
pub use adapter::{AdapterInjections, BlockAdapterKwargs, ImageEncoder, IpAdapter};
pub use backbone::{Backbone, BlockInput, EntityConditioning, EntityContext};
pub use controlnet::{
    Annotator, ControlNet, ControlNetContext, ControlNetUnit, ControlProcessor, ControlResiduals,
    MultiControlNet,
};
pub use encoders::{LatentDecoder, LatentEncoder, PromptEmbedding, PromptRefiner, TextEncoder};
pub use registry::{DeviceManager, KeepResident, ModelRegistry, ModelRole, StageScope};
