//! Model registry and stage residency.
//!
//! The pipeline resolves every model role once, at construction, from a
//! [`ModelRegistry`]. While a stage runs, the models it needs are held
//! resident through a [`StageScope`], which releases them when dropped.

use std::fmt;

use tracing::debug;

use super::adapter::{ImageEncoder, IpAdapter};
use super::backbone::Backbone;
use super::controlnet::ControlNetUnit;
use super::encoders::{LatentDecoder, LatentEncoder, PromptRefiner, TextEncoder};

/// Roles a loaded model can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// Prompt encoder stack.
    TextEncoder,
    /// Diffusion-transformer backbone.
    Dit,
    /// Pixel to latent encoder.
    VaeEncoder,
    /// Latent to pixel decoder.
    VaeDecoder,
    /// Structural control networks.
    ControlNet,
    /// Reference-image adapter.
    IpAdapter,
    /// Vision encoder feeding the adapter.
    IpAdapterImageEncoder,
}

impl ModelRole {
    /// Every role, in pipeline order.
    pub const ALL: [ModelRole; 7] = [
        ModelRole::TextEncoder,
        ModelRole::Dit,
        ModelRole::VaeEncoder,
        ModelRole::VaeDecoder,
        ModelRole::ControlNet,
        ModelRole::IpAdapter,
        ModelRole::IpAdapterImageEncoder,
    ];

    /// Returns the string representation of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::TextEncoder => "text_encoder",
            ModelRole::Dit => "dit",
            ModelRole::VaeEncoder => "vae_encoder",
            ModelRole::VaeDecoder => "vae_decoder",
            ModelRole::ControlNet => "controlnet",
            ModelRole::IpAdapter => "ipadapter",
            ModelRole::IpAdapterImageEncoder => "ipadapter_image_encoder",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Loaded models, one slot per role.
#[derive(Default)]
pub struct ModelRegistry {
    pub(crate) text_encoder: Option<Box<dyn TextEncoder>>,
    pub(crate) prompt_refiners: Vec<Box<dyn PromptRefiner>>,
    pub(crate) dit: Option<Box<dyn Backbone>>,
    pub(crate) vae_encoder: Option<Box<dyn LatentEncoder>>,
    pub(crate) vae_decoder: Option<Box<dyn LatentDecoder>>,
    pub(crate) controlnet_units: Vec<ControlNetUnit>,
    pub(crate) ipadapter: Option<Box<dyn IpAdapter>>,
    pub(crate) ipadapter_image_encoder: Option<Box<dyn ImageEncoder>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("roles", &self.roles())
            .field("prompt_refiners", &self.prompt_refiners.len())
            .finish()
    }
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the text encoder.
    pub fn with_text_encoder(mut self, model: Box<dyn TextEncoder>) -> Self {
        self.text_encoder = Some(model);
        self
    }

    /// Adds a prompt refiner; refiners run in registration order.
    pub fn with_prompt_refiner(mut self, refiner: Box<dyn PromptRefiner>) -> Self {
        self.prompt_refiners.push(refiner);
        self
    }

    /// Registers the backbone.
    pub fn with_dit(mut self, model: Box<dyn Backbone>) -> Self {
        self.dit = Some(model);
        self
    }

    /// Registers the latent encoder.
    pub fn with_vae_encoder(mut self, model: Box<dyn LatentEncoder>) -> Self {
        self.vae_encoder = Some(model);
        self
    }

    /// Registers the latent decoder.
    pub fn with_vae_decoder(mut self, model: Box<dyn LatentDecoder>) -> Self {
        self.vae_decoder = Some(model);
        self
    }

    /// Adds a control unit.
    pub fn with_controlnet_unit(mut self, unit: ControlNetUnit) -> Self {
        self.controlnet_units.push(unit);
        self
    }

    /// Registers the reference-image adapter and its image encoder.
    pub fn with_ipadapter(
        mut self,
        adapter: Box<dyn IpAdapter>,
        image_encoder: Box<dyn ImageEncoder>,
    ) -> Self {
        self.ipadapter = Some(adapter);
        self.ipadapter_image_encoder = Some(image_encoder);
        self
    }

    /// Returns true if a model fills `role`.
    pub fn has(&self, role: ModelRole) -> bool {
        match role {
            ModelRole::TextEncoder => self.text_encoder.is_some(),
            ModelRole::Dit => self.dit.is_some(),
            ModelRole::VaeEncoder => self.vae_encoder.is_some(),
            ModelRole::VaeDecoder => self.vae_decoder.is_some(),
            ModelRole::ControlNet => !self.controlnet_units.is_empty(),
            ModelRole::IpAdapter => self.ipadapter.is_some(),
            ModelRole::IpAdapterImageEncoder => self.ipadapter_image_encoder.is_some(),
        }
    }

    /// Returns every filled role.
    pub fn roles(&self) -> Vec<ModelRole> {
        ModelRole::ALL.into_iter().filter(|r| self.has(*r)).collect()
    }
}

/// Moves models on and off the accelerator between stages.
pub trait DeviceManager {
    /// Makes `roles` resident.
    fn load(&self, roles: &[ModelRole]);

    /// Releases `roles`.
    fn offload(&self, roles: &[ModelRole]);
}

/// Keeps every model resident for the lifetime of the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepResident;

impl DeviceManager for KeepResident {
    fn load(&self, _roles: &[ModelRole]) {}

    fn offload(&self, _roles: &[ModelRole]) {}
}

/// Holds a set of roles resident until dropped.
pub struct StageScope<'a> {
    manager: &'a dyn DeviceManager,
    roles: Vec<ModelRole>,
}

impl<'a> StageScope<'a> {
    /// Loads `roles` and returns a guard that offloads them on drop.
    pub fn acquire(manager: &'a dyn DeviceManager, roles: &[ModelRole]) -> Self {
        debug!(roles = ?roles, "Loading models for stage");
        manager.load(roles);
        Self {
            manager,
            roles: roles.to_vec(),
        }
    }
}

impl Drop for StageScope<'_> {
    fn drop(&mut self) {
        self.manager.offload(&self.roles);
    }
}
