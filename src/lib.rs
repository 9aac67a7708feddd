//! flux-pipeline: denoising orchestration for Flux-style diffusion transformers.
//!
//! This library drives text-to-image and image-to-image generation around a
//! diffusion-transformer backbone. The networks themselves are supplied by
//! the caller through the traits in [`models`]; the crate owns the schedule,
//! the conditioning assembly and the denoising loop.
//!
//! # Modules
//!
//! - [`types`]: Request, image and mask types
//! - [`config`]: Runtime configuration (PipelineConfig, SchedulerConfig, TilerConfig)
//! - [`error`]: Error types and codes (PipelineError, ErrorCode)
//! - [`models`]: Collaborator traits and the model registry
//! - [`pipeline`]: Scheduler, tiling, fusion and the orchestrator
//!
//! # Example
//!
//! ```rust,ignore
//! use flux_pipeline::{
//!     FluxImagePipeline, GenerationRequest, KeepResident, ModelRegistry, PipelineConfig,
//! };
//!
//! let registry = ModelRegistry::new()
//!     .with_text_encoder(text_encoder)
//!     .with_dit(dit)
//!     .with_vae_decoder(vae_decoder);
//! let pipeline =
//!     FluxImagePipeline::new(registry, PipelineConfig::from_env(), Box::new(KeepResident))?;
//!
//! let request = GenerationRequest::new("a lighthouse at dusk, film grain")
//!     .with_negative("blurry", 2.0)
//!     .with_size(768, 1024)
//!     .with_seed(42);
//! let image = pipeline.generate(&request, |step, total| println!("{}/{}", step, total))?;
//! let rgb = image.to_rgb8();
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use config::{PipelineConfig, SchedulerConfig, TilerConfig};
pub use error::{ErrorCode, PipelineError, Result};
pub use models::{DeviceManager, KeepResident, ModelRegistry, ModelRole};
pub use pipeline::{FluxImagePipeline, PipelineStage};
pub use types::{GenerationRequest, Mask, PixelImage};
