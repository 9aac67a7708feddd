//! Denoising orchestration.
//!
//! - [`scheduler`]: flow matching schedule and Euler step
//! - [`latent`]: seeded noise and latent shapes
//! - [`prompter`]: prompt refinement and encoding
//! - [`conditioning`]: per-call conditioning bundles
//! - [`tiler`]: overlapping tile evaluation
//! - [`denoise`]: one noise prediction through the backbone
//! - [`fusion`]: guidance, regional and inpainting fusion
//! - [`generate`]: the step loop

pub mod conditioning;
pub mod denoise;
pub mod fusion;
pub mod generate;
pub mod latent;
pub mod prompter;
pub mod scheduler;
pub mod tiler;

// Re-export commonly used types
pub use conditioning::{ConditioningBundle, EntityInputs, ExtraInput};
pub use denoise::DenoisingEvaluator;
pub use fusion::{
    classifier_free_guidance, inpaint_fusion, merge_local_predictions, RegionPrediction,
};
pub use generate::{FluxImagePipeline, PipelineStage};
pub use latent::generate_noise;
pub use prompter::Prompter;
pub use scheduler::FlowMatchScheduler;
pub use tiler::{TileBounds, TileContext, TileEvaluator, TileWorker};
